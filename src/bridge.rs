//! Render-event bridge.
//!
//! [`CaptureClient`] is what the renderer calls back into. Paints go to the
//! [`FrameBridge`], which drops anything that is not a full-size view frame,
//! ignores frames while recording is off, and otherwise stamps the frame with
//! the next sequence number and hands it to the configured sink. The recording
//! flag and the frame counters are atomics so the paint path never touches the
//! pool's lock except to acquire a buffer.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::devtools::{DevToolsTable, MessageId};
use crate::renderer::{PaintElementKind, RenderClient};
use crate::writer::{frame_file_name, write_file_atomically, FrameWriter};
use crate::{encode, CaptureMode, Error, Result, Viewport};

/// Where accepted frames go
pub enum FrameSink {
    /// Copy into a pool buffer and queue for the asynchronous writer
    Raw {
        writer: Arc<FrameWriter>,
        acquire_timeout: Duration,
    },
    /// Encode a PNG and write it before returning
    Png { output_dir: PathBuf },
}

impl FrameSink {
    pub fn mode(&self) -> CaptureMode {
        match self {
            FrameSink::Raw { .. } => CaptureMode::Raw,
            FrameSink::Png { .. } => CaptureMode::Png,
        }
    }
}

/// Classifies painted frames and forwards the accepted ones.
pub struct FrameBridge {
    viewport: Viewport,
    frame_size: usize,
    target: u64,
    recording: AtomicBool,
    accepted: AtomicU64,
    painted: AtomicU64,
    dropped: AtomicU64,
    // image mode only; raw mode reads the writer's counters
    png_written: AtomicU64,
    png_failed: AtomicU64,
    sink: FrameSink,
}

impl FrameBridge {
    pub fn new(viewport: Viewport, target_frames: u64, sink: FrameSink) -> Self {
        Self {
            viewport,
            frame_size: viewport.frame_size().unwrap_or(0),
            target: target_frames,
            recording: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            painted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            png_written: AtomicU64::new(0),
            png_failed: AtomicU64::new(0),
            sink,
        }
    }

    /// Turn recording on. Refused (returns false) once the target is reached.
    pub fn start_recording(&self) -> bool {
        if self.accepted_frames() >= self.target {
            return false;
        }
        self.recording.store(true, Ordering::Release);
        true
    }

    /// Turn recording off. Returns whether it was on; repeated calls are no-ops.
    pub fn stop_recording(&self) -> bool {
        self.recording.swap(false, Ordering::AcqRel)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn target_frames(&self) -> u64 {
        self.target
    }

    /// Frames accepted into the output sequence
    pub fn accepted_frames(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    /// Well-formed view frames seen, recording or not
    pub fn painted_frames(&self) -> u64 {
        self.painted.load(Ordering::Acquire)
    }

    /// Frames that should have been accepted but could not be handed off
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Frames durably on disk
    pub fn written_frames(&self) -> u64 {
        match &self.sink {
            FrameSink::Raw { writer, .. } => writer.written_count(),
            FrameSink::Png { .. } => self.png_written.load(Ordering::Acquire),
        }
    }

    /// Frames whose write failed
    pub fn failed_writes(&self) -> u64 {
        match &self.sink {
            FrameSink::Raw { writer, .. } => writer.failed_count(),
            FrameSink::Png { .. } => self.png_failed.load(Ordering::Acquire),
        }
    }

    pub fn sink(&self) -> &FrameSink {
        &self.sink
    }

    pub fn on_paint(&self, kind: PaintElementKind, buffer: Option<&[u8]>, width: u32, height: u32) {
        if kind != PaintElementKind::View {
            return;
        }
        let Some(buffer) = buffer else {
            return;
        };
        if width != self.viewport.width || height != self.viewport.height {
            return;
        }
        if buffer.len() < self.frame_size {
            return;
        }
        let pixels = &buffer[..self.frame_size];

        self.painted.fetch_add(1, Ordering::AcqRel);
        if !self.is_recording() {
            return;
        }

        let sequence = self.accepted.load(Ordering::Acquire);
        if sequence >= self.target {
            self.stop_recording();
            return;
        }

        if let Err(e) = self.persist(sequence, pixels) {
            log::warn!("dropping frame {}: {}", sequence, e);
            self.dropped.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let accepted = self.accepted.fetch_add(1, Ordering::AcqRel) + 1;
        log::trace!("accepted frame {}", sequence);
        if accepted >= self.target && self.stop_recording() {
            log::debug!("target of {} frames reached, recording stopped", self.target);
        }
    }

    /// Hand one frame to the sink. An error means the frame was not taken and
    /// its sequence number stays free.
    fn persist(&self, sequence: u64, pixels: &[u8]) -> Result<()> {
        match &self.sink {
            FrameSink::Raw {
                writer,
                acquire_timeout,
            } => writer.submit_copy(sequence, pixels, *acquire_timeout),
            FrameSink::Png { output_dir } => {
                let png = encode::encode_png(pixels, self.viewport.width, self.viewport.height)?;
                let path = output_dir.join(frame_file_name(sequence, CaptureMode::Png));
                match write_file_atomically(&path, &png) {
                    Ok(()) => {
                        self.png_written.fetch_add(1, Ordering::AcqRel);
                    }
                    Err(e) => {
                        // the frame still occupies its slot in the sequence
                        log::error!("failed to write frame {} to {}: {}", sequence, path.display(), e);
                        self.png_failed.fetch_add(1, Ordering::AcqRel);
                    }
                }
                Ok(())
            }
        }
    }
}

/// The renderer-facing side of a capture session: lifecycle flags, the
/// DevTools rendezvous table and the frame bridge.
pub struct CaptureClient {
    bridge: FrameBridge,
    devtools: DevToolsTable,
    surface_created: AtomicBool,
    surface_seen: AtomicBool,
    load_complete: AtomicBool,
    closed: AtomicBool,
}

impl CaptureClient {
    pub fn new(bridge: FrameBridge) -> Self {
        Self {
            bridge,
            devtools: DevToolsTable::new(),
            surface_created: AtomicBool::new(false),
            surface_seen: AtomicBool::new(false),
            load_complete: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn bridge(&self) -> &FrameBridge {
        &self.bridge
    }

    pub fn devtools(&self) -> &DevToolsTable {
        &self.devtools
    }

    pub fn has_surface(&self) -> bool {
        self.surface_created.load(Ordering::Acquire)
    }

    /// Whether a surface was ever created, including one since closed.
    pub fn surface_was_created(&self) -> bool {
        self.surface_seen.load(Ordering::Acquire)
    }

    pub fn is_load_complete(&self) -> bool {
        self.load_complete.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl RenderClient for CaptureClient {
    fn on_surface_created(&self) {
        self.closed.store(false, Ordering::Release);
        self.surface_created.store(true, Ordering::Release);
        self.surface_seen.store(true, Ordering::Release);
    }

    fn on_paint(&self, kind: PaintElementKind, buffer: Option<&[u8]>, width: u32, height: u32) {
        self.bridge.on_paint(kind, buffer, width, height);
    }

    fn on_main_frame_load_complete(&self) {
        self.load_complete.store(true, Ordering::Release);
    }

    fn on_devtools_result(&self, id: MessageId, success: bool) {
        self.devtools.complete(id, success);
    }

    fn on_devtools_event(&self, method: &str) {
        self.devtools.on_event(method);
    }

    fn on_before_close(&self) {
        self.surface_created.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
    }
}

/// Build the sink for `mode`, creating the output directory.
pub fn build_sink(
    mode: CaptureMode,
    output_dir: PathBuf,
    writer: Option<Arc<FrameWriter>>,
    acquire_timeout: Duration,
) -> Result<FrameSink> {
    match mode {
        CaptureMode::Raw => {
            let writer = writer
                .ok_or_else(|| Error::InitializationError("raw capture needs a frame writer".into()))?;
            Ok(FrameSink::Raw {
                writer,
                acquire_timeout,
            })
        }
        CaptureMode::Png => {
            std::fs::create_dir_all(&output_dir)?;
            Ok(FrameSink::Png { output_dir })
        }
    }
}
