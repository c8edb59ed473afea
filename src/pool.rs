//! Fixed-size pool of reusable frame buffers.
//!
//! Every buffer is allocated once, at `width * height * 4` bytes, when the pool
//! is built. Ownership moves between two disjoint places: the free list (owned
//! by the pool) and a single [`PoolBuffer`] handle (owned by whoever is filling
//! or persisting a frame). Dropping the handle puts the storage back on the
//! free list and wakes one waiter, so a buffer can never be both free and in
//! flight, and a lost job can never leak a slot.

use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Storage for one pool slot. The boxed slice is never resized.
struct Slot {
    id: usize,
    data: Box<[u8]>,
}

struct PoolState {
    free: Vec<Slot>,
    in_flight: HashSet<usize>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    frame_size: usize,
    capacity: usize,
}

impl PoolInner {
    fn put_back(&self, slot: Slot) {
        let mut state = self.state.lock();
        if !state.in_flight.remove(&slot.id) {
            log::error!("pool slot {} released while not in flight", slot.id);
        }
        state.free.push(slot);
        drop(state);
        self.available.notify_one();
    }

    fn checkout(self: &Arc<Self>, state: &mut PoolState) -> Option<PoolBuffer> {
        let slot = state.free.pop()?;
        state.in_flight.insert(slot.id);
        Some(PoolBuffer {
            slot: Some(slot),
            sequence: 0,
            len: 0,
            pool: Arc::clone(self),
        })
    }
}

/// A pool of pre-allocated, fixed-capacity frame buffers.
///
/// Cloning the pool is cheap; all clones share the same slots.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Allocate `capacity` buffers of `frame_size` bytes each.
    pub fn new(capacity: usize, frame_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ConfigError("frame pool needs at least one buffer".into()));
        }
        if frame_size == 0 {
            return Err(Error::ConfigError("frame pool buffers cannot be empty".into()));
        }

        let free = (0..capacity)
            .map(|id| Slot {
                id,
                data: vec![0u8; frame_size].into_boxed_slice(),
            })
            .collect();

        log::debug!("frame pool: {} buffers x {} bytes", capacity, frame_size);

        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free,
                    in_flight: HashSet::with_capacity(capacity),
                    shutdown: false,
                }),
                available: Condvar::new(),
                frame_size,
                capacity,
            }),
        })
    }

    /// Block until a buffer is free. Returns `None` once the pool is shut down.
    pub fn acquire(&self) -> Option<PoolBuffer> {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(buf) = self.inner.checkout(&mut state) {
                return Some(buf);
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PoolBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(buf) = self.inner.checkout(&mut state) {
                return Some(buf);
            }
            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if state.shutdown {
                    return None;
                }
                return self.inner.checkout(&mut state);
            }
        }
    }

    /// Take a buffer only if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolBuffer> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return None;
        }
        self.inner.checkout(&mut state)
    }

    /// Return a buffer to the free set. Equivalent to dropping it.
    pub fn release(&self, buffer: PoolBuffer) {
        drop(buffer);
    }

    /// Wake every waiter; subsequent acquisitions return `None`.
    ///
    /// Buffers still in flight are accepted back normally.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Total number of buffers, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Byte capacity of each buffer.
    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }

    /// Buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Buffers currently checked out.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FramePool")
            .field("capacity", &self.inner.capacity)
            .field("frame_size", &self.inner.frame_size)
            .field("free", &state.free.len())
            .field("in_flight", &state.in_flight.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

/// Exclusive handle to one pool buffer, tagged with the frame's sequence
/// number and the number of bytes in use.
pub struct PoolBuffer {
    slot: Option<Slot>,
    sequence: u64,
    len: usize,
    pool: Arc<PoolInner>,
}

impl PoolBuffer {
    pub fn slot_id(&self) -> usize {
        self.slot.as_ref().map(|s| s.id).unwrap_or(usize::MAX)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Full byte capacity of the underlying slot.
    pub fn capacity(&self) -> usize {
        self.slot.as_ref().map(|s| s.data.len()).unwrap_or(0)
    }

    /// Bytes in use.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the buffer, replacing its previous contents.
    pub fn fill_from(&mut self, src: &[u8]) -> Result<()> {
        let dst = self.as_mut_slice();
        if src.len() > dst.len() {
            return Err(Error::RenderError(format!(
                "frame of {} bytes does not fit a {} byte pool buffer",
                src.len(),
                dst.len()
            )));
        }
        dst[..src.len()].copy_from_slice(src);
        self.set_len(src.len());
        Ok(())
    }

    /// The bytes in use.
    pub fn as_slice(&self) -> &[u8] {
        match &self.slot {
            Some(slot) => &slot.data[..self.len],
            None => &[],
        }
    }

    /// The whole slot, for callers that render straight into it. Call
    /// [`set_len`](Self::set_len) afterwards.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.slot {
            Some(slot) => &mut slot.data[..],
            None => &mut [],
        }
    }

    /// Mark the first `len` bytes as in use, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.put_back(slot);
        }
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("slot", &self.slot_id())
            .field("sequence", &self.sequence)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn acquire_and_release_is_a_bijection() {
        let pool = FramePool::new(3, 16).unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(pool.in_flight(), 3);
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().is_none());

        let ids: HashSet<usize> = [a.slot_id(), b.slot_id(), c.slot_id()].into_iter().collect();
        assert_eq!(ids.len(), 3);

        pool.release(a);
        drop(b);
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.available(), 2);
        drop(c);
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn buffers_are_never_reallocated() {
        let pool = FramePool::new(2, 64).unwrap();
        let mut original = HashSet::new();
        {
            let mut a = pool.acquire().unwrap();
            let mut b = pool.acquire().unwrap();
            original.insert(a.as_mut_slice().as_ptr() as usize);
            original.insert(b.as_mut_slice().as_ptr() as usize);
        }

        for round in 0..20u8 {
            let mut buf = pool.acquire().unwrap();
            buf.fill_from(&[round; 64]).unwrap();
            assert_eq!(buf.capacity(), 64);
            assert!(original.contains(&(buf.as_mut_slice().as_ptr() as usize)));
        }
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let pool = FramePool::new(1, 8).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|b| b.slot_id()))
        };

        thread::sleep(Duration::from_millis(50));
        let id = held.slot_id();
        drop(held);
        assert_eq!(waiter.join().unwrap(), Some(id));
    }

    #[test]
    fn acquire_timeout_gives_up_when_exhausted() {
        let pool = FramePool::new(1, 8).unwrap();
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        assert!(pool.acquire_timeout(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn shutdown_releases_waiters_with_no_buffer() {
        let pool = FramePool::new(1, 8).unwrap();
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!pool.is_shutdown());
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(waiter.join().unwrap());

        // in-flight buffers still come home after shutdown
        drop(held);
        assert_eq!(pool.available(), 1);
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn fill_rejects_oversized_frames() {
        let pool = FramePool::new(1, 4).unwrap();
        let mut buf = pool.acquire().unwrap();
        assert!(buf.fill_from(&[1, 2, 3, 4, 5]).is_err());
        buf.fill_from(&[9, 8]).unwrap();
        assert_eq!(buf.as_slice(), &[9, 8]);
    }

    #[test]
    fn rendering_in_place_sets_the_length() {
        let pool = FramePool::new(1, 4).unwrap();
        let mut buf = pool.acquire().unwrap();
        buf.as_mut_slice()[..3].copy_from_slice(&[7, 7, 7]);
        assert!(buf.is_empty());
        buf.set_len(3);
        assert_eq!(buf.as_slice(), &[7, 7, 7]);
        buf.set_len(100);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn zero_sized_pools_are_rejected() {
        assert!(FramePool::new(0, 16).is_err());
        assert!(FramePool::new(4, 0).is_err());
    }
}
