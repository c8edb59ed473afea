//! Asynchronous frame persistence.
//!
//! The render thread hands filled [`PoolBuffer`]s to [`FrameWriter::submit`];
//! a fixed set of worker threads pops them in FIFO order, writes each one to
//! its own file and drops the buffer back into the pool. Frame order on disk
//! comes from the file names alone, so it does not matter which worker
//! finishes first.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::pool::{FramePool, PoolBuffer};
use crate::{CaptureMode, Error, Result};

/// Digits in every frame file name. Lexical order equals sequence order up to
/// a million frames.
pub const FRAME_INDEX_WIDTH: usize = 6;

/// `frame-000042.bgra`, `frame-000042.png`, ...
pub fn frame_file_name(sequence: u64, mode: CaptureMode) -> String {
    format!(
        "frame-{:0width$}.{}",
        sequence,
        mode.extension(),
        width = FRAME_INDEX_WIDTH
    )
}

/// Write `data` to `<path>.tmp`, then rename it onto `path`. A failed attempt
/// removes the temp file so no partial frame is ever left under its final name.
pub fn write_file_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

struct QueueState {
    jobs: VecDeque<PoolBuffer>,
    active: usize,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    work_ready: Condvar,
    idle: Condvar,
    written: AtomicU64,
    failed: AtomicU64,
    output_dir: PathBuf,
}

/// Producer/consumer frame writer backed by a [`FramePool`].
pub struct FrameWriter {
    shared: Arc<Shared>,
    pool: FramePool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameWriter {
    /// Create `output_dir` if needed and start `threads` workers.
    pub fn new(output_dir: impl Into<PathBuf>, pool: FramePool, threads: usize) -> Result<Self> {
        let output_dir = output_dir.into();
        if threads == 0 {
            return Err(Error::ConfigError("frame writer needs at least one thread".into()));
        }
        fs::create_dir_all(&output_dir)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(pool.capacity()),
                active: 0,
                stop: false,
            }),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            written: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            output_dir,
        });

        let writer = Self {
            shared,
            pool,
            workers: Mutex::new(Vec::with_capacity(threads)),
        };

        for i in 0..threads {
            let shared = Arc::clone(&writer.shared);
            let spawned = thread::Builder::new()
                .name(format!("rfcapture-writer-{}", i))
                .spawn(move || worker_loop(shared));
            match spawned {
                Ok(handle) => writer.workers.lock().push(handle),
                Err(e) => {
                    // Dropping `writer` stops and joins the threads already started.
                    return Err(Error::InitializationError(format!(
                        "failed to spawn writer thread: {}",
                        e
                    )));
                }
            }
        }

        log::debug!(
            "frame writer: {} threads -> {}",
            threads,
            writer.shared.output_dir.display()
        );
        Ok(writer)
    }

    /// Queue a filled buffer. Never blocks on I/O.
    ///
    /// After shutdown the buffer goes straight back to the pool and an error
    /// is returned.
    pub fn submit(&self, buffer: PoolBuffer) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.stop {
            return Err(Error::Other("frame writer is shut down".into()));
        }
        state.jobs.push_back(buffer);
        drop(state);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Copy a transient frame into a pool buffer and queue it.
    ///
    /// Waits up to `acquire_timeout` for a free buffer.
    pub fn submit_copy(&self, sequence: u64, data: &[u8], acquire_timeout: Duration) -> Result<()> {
        let mut buffer = match self.pool.acquire_timeout(acquire_timeout) {
            Some(buffer) => buffer,
            None if self.pool.is_shutdown() => {
                return Err(Error::Other("frame pool is shut down".into()));
            }
            None => {
                return Err(Error::Timeout {
                    what: "a free frame buffer",
                    timeout_ms: acquire_timeout.as_millis() as u64,
                })
            }
        };
        buffer.fill_from(data)?;
        buffer.set_sequence(sequence);
        self.submit(buffer)
    }

    /// Block until every submitted frame has been written (or has failed) and
    /// no worker is mid-write.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while !(state.jobs.is_empty() && state.active == 0) {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Frames durably written so far.
    pub fn written_count(&self) -> u64 {
        self.shared.written.load(Ordering::Acquire)
    }

    /// Frames whose write failed.
    pub fn failed_count(&self) -> u64 {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Frames queued or being written.
    pub fn pending_count(&self) -> usize {
        let state = self.shared.state.lock();
        state.jobs.len() + state.active
    }

    pub fn output_dir(&self) -> &Path {
        &self.shared.output_dir
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Stop accepting work, let the workers drain the queue, and join them.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.state.lock().stop = true;
        self.shared.work_ready.notify_all();

        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("frame writer thread panicked");
            }
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.active += 1;
                    break job;
                }
                if state.stop {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        let sequence = job.sequence();
        let path = shared
            .output_dir
            .join(frame_file_name(sequence, CaptureMode::Raw));
        let outcome = write_file_atomically(&path, job.as_slice());
        drop(job);

        match outcome {
            Ok(()) => {
                shared.written.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => {
                log::error!("failed to write frame {} to {}: {}", sequence, path.display(), e);
                shared.failed.fetch_add(1, Ordering::AcqRel);
            }
        }

        let mut state = shared.state.lock();
        state.active -= 1;
        if state.jobs.is_empty() && state.active == 0 {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 16;
    const WAIT: Duration = Duration::from_secs(5);

    fn frame(seed: u8) -> Vec<u8> {
        (0..FRAME as u8).map(|i| i.wrapping_add(seed)).collect()
    }

    #[test]
    fn file_names_sort_in_sequence_order() {
        assert_eq!(frame_file_name(0, CaptureMode::Raw), "frame-000000.bgra");
        assert_eq!(frame_file_name(59, CaptureMode::Png), "frame-000059.png");
        let mut names: Vec<_> = [10u64, 9, 100, 1].iter().map(|&s| frame_file_name(s, CaptureMode::Raw)).collect();
        names.sort();
        assert_eq!(names[0], "frame-000001.bgra");
        assert_eq!(names[3], "frame-000100.bgra");
    }

    #[test]
    fn writes_every_submitted_frame() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FramePool::new(2, FRAME).unwrap();
        let writer = FrameWriter::new(dir.path(), pool.clone(), 2).unwrap();

        for seq in 0..8u64 {
            writer.submit_copy(seq, &frame(seq as u8), WAIT).unwrap();
            assert!(pool.in_flight() <= pool.capacity());
        }
        writer.flush();

        assert_eq!(writer.written_count(), 8);
        assert_eq!(writer.failed_count(), 0);
        assert_eq!(writer.pending_count(), 0);
        assert_eq!(pool.available(), pool.capacity());

        for seq in 0..8u64 {
            let data = fs::read(dir.path().join(frame_file_name(seq, CaptureMode::Raw))).unwrap();
            assert_eq!(data, frame(seq as u8));
        }
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn failed_writes_do_not_block_flush() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("frames");
        let pool = FramePool::new(2, FRAME).unwrap();
        let writer = FrameWriter::new(&target, pool.clone(), 1).unwrap();

        // Replace the output directory with a plain file so every write fails.
        fs::remove_dir_all(&target).unwrap();
        fs::write(&target, b"not a directory").unwrap();

        for seq in 0..3u64 {
            writer.submit_copy(seq, &frame(0), WAIT).unwrap();
        }
        writer.flush();

        assert_eq!(writer.written_count(), 0);
        assert_eq!(writer.failed_count(), 3);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn shutdown_drains_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FramePool::new(16, FRAME).unwrap();
        let writer = FrameWriter::new(dir.path(), pool.clone(), 1).unwrap();

        for seq in 0..16u64 {
            writer.submit_copy(seq, &frame(1), WAIT).unwrap();
        }
        writer.shutdown();
        writer.shutdown();

        assert_eq!(writer.written_count(), 16);
        assert_eq!(pool.available(), 16);
    }

    #[test]
    fn submit_after_shutdown_returns_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FramePool::new(1, FRAME).unwrap();
        let writer = FrameWriter::new(dir.path(), pool.clone(), 1).unwrap();
        writer.shutdown();

        let buf = pool.acquire().unwrap();
        assert!(writer.submit(buf).is_err());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn copy_times_out_when_pool_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FramePool::new(1, FRAME).unwrap();
        let writer = FrameWriter::new(dir.path(), pool.clone(), 1).unwrap();

        let _held = pool.acquire().unwrap();
        let err = writer
            .submit_copy(0, &frame(0), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn copy_fails_fast_once_the_pool_is_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let pool = FramePool::new(1, FRAME).unwrap();
        let writer = FrameWriter::new(dir.path(), pool.clone(), 1).unwrap();
        pool.shutdown();

        let start = std::time::Instant::now();
        let err = writer
            .submit_copy(0, &frame(0), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
