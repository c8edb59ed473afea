//! RFox Capture
//!
//! Drives a headless renderer off-screen and records the page as a numbered
//! sequence of frames on disk, at a fixed resolution, frame rate and duration.
//!
//! # Features
//!
//! - **Virtual-time pacing** (default): the renderer's clock only moves when we
//!   step it, so animations are captured deterministically and faster than
//!   real time.
//! - **Asynchronous persistence**: raw frames are copied into a fixed pool of
//!   buffers and written by a small worker pool, off the render thread.
//! - **Swappable renderers**: anything implementing [`renderer::Renderer`]. The
//!   built-in [`renderer::pattern::PatternRenderer`] needs no browser; the
//!   `cdp` feature adds a headless Chrome backend.
//!
//! # Example
//!
//! ```no_run
//! use rfcapture::{CaptureConfig, CaptureSession, Viewport};
//! use rfcapture::renderer::{new_renderer, Backend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CaptureConfig {
//!     url: "http://127.0.0.1:8000/".to_string(),
//!     viewport: Viewport { width: 1280, height: 720 },
//!     duration_seconds: 2,
//!     fps: 30,
//!     ..Default::default()
//! };
//!
//! let mut session = CaptureSession::new(config, new_renderer(Backend::Pattern)?)?;
//! session.initialize()?;
//! let report = session.record()?;
//! session.shutdown();
//! println!("complete: {}", report.is_complete());
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod error;
pub use error::{Error, Result};

pub mod bridge;
pub mod devtools;
pub mod encode;
pub mod pacer;
pub mod pool;
pub mod renderer;
pub mod session;
pub mod writer;

pub use bridge::{CaptureClient, FrameBridge};
pub use pool::{FramePool, PoolBuffer};
pub use session::{CaptureReport, CaptureSession};
pub use writer::FrameWriter;

/// Viewport dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Viewport {
    /// Bytes in one BGRA frame of this size, `None` on overflow.
    pub fn frame_size(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(4)
    }
}

/// How accepted frames are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Uncompressed BGRA dumps handed to the asynchronous [`FrameWriter`]
    #[default]
    Raw,
    /// PNG stills encoded and written synchronously on the render thread
    Png,
}

impl CaptureMode {
    /// File extension of the frames this mode produces
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureMode::Raw => "bgra",
            CaptureMode::Png => "png",
        }
    }
}

impl std::str::FromStr for CaptureMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" | "bgra" => Ok(CaptureMode::Raw),
            "png" | "image" => Ok(CaptureMode::Png),
            other => Err(Error::ConfigError(format!("unknown capture mode '{}'", other))),
        }
    }
}

/// Which pacing loop drives the renderer during recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PacingStrategy {
    /// Step the renderer's virtual clock one frame interval at a time
    #[default]
    VirtualTime,
    /// Request a repaint every wall-clock frame interval
    Interval,
}

impl std::str::FromStr for PacingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "virtual-time" | "virtual" => Ok(PacingStrategy::VirtualTime),
            "interval" | "wall-clock" => Ok(PacingStrategy::Interval),
            other => Err(Error::ConfigError(format!("unknown pacing strategy '{}'", other))),
        }
    }
}

/// Bounded waits used by the session and the pacers, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTimeouts {
    /// Render surface creation
    pub surface_ms: u64,
    /// Main-frame load completion
    pub load_ms: u64,
    /// Each DevTools request sent during session setup
    pub setup_ms: u64,
    /// Acknowledgment of each virtual-time advance
    pub step_ack_ms: u64,
    /// Frame delivery after each step
    pub step_frame_ms: u64,
    /// Final wait for in-flight paints after the loop
    pub drain_ms: u64,
    /// Renderer close confirmation
    pub close_ms: u64,
    /// Waiting for a free pool buffer on the paint path
    pub pool_acquire_ms: u64,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            surface_ms: 10_000,
            load_ms: 30_000,
            setup_ms: 2_000,
            step_ack_ms: 500,
            step_frame_ms: 500,
            drain_ms: 2_000,
            close_ms: 2_000,
            pool_acquire_ms: 1_000,
        }
    }
}

impl SessionTimeouts {
    pub(crate) fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }
}

/// Configuration for a capture session
///
/// All fields are fixed once the session is built; there is no runtime
/// reconfiguration. Defaults follow the command-line tool.
///
/// # Examples
///
/// ```
/// let cfg = rfcapture::CaptureConfig::default();
/// assert_eq!(cfg.target_frames(), 150);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Page to record
    pub url: String,
    /// Directory receiving one file per frame
    pub output_dir: PathBuf,
    /// Render surface size; frames of any other size are dropped
    pub viewport: Viewport,
    /// Recording length in seconds of page time
    pub duration_seconds: u32,
    /// Output frame rate
    pub fps: u32,
    /// Disk writer threads (raw mode)
    pub writer_threads: usize,
    /// Pre-allocated frame buffers, i.e. the maximum in-flight depth (raw mode)
    pub pool_size: usize,
    /// Persistence mode
    pub mode: CaptureMode,
    /// Pacing loop
    pub pacing: PacingStrategy,
    /// Bounded waits
    pub timeouts: SessionTimeouts,
    /// Consecutive stalls tolerated, as a multiple of the target frame count
    pub stall_multiple: u32,
    /// After each acknowledged advance, also wait for the budget-expired event
    pub await_budget_expiry: bool,
}

/// Writer threads used when none are configured: one per CPU, clamped to 2..=3.
pub fn default_writer_threads() -> usize {
    num_cpus::get().clamp(2, 3)
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let writer_threads = default_writer_threads();
        Self {
            url: String::new(),
            output_dir: PathBuf::from("out"),
            viewport: Viewport::default(),
            duration_seconds: 5,
            fps: 30,
            writer_threads,
            pool_size: writer_threads * 2 + 2,
            mode: CaptureMode::default(),
            pacing: PacingStrategy::default(),
            timeouts: SessionTimeouts::default(),
            stall_multiple: 3,
            await_budget_expiry: false,
        }
    }
}

impl CaptureConfig {
    /// Number of frames the session must produce
    pub fn target_frames(&self) -> u64 {
        self.duration_seconds as u64 * self.fps as u64
    }

    /// Bytes in one frame (`width * height * 4`)
    pub fn frame_size(&self) -> usize {
        self.viewport.frame_size().unwrap_or(0)
    }

    /// Consecutive stalls after which the pacer gives up
    pub fn stall_limit(&self) -> u64 {
        self.target_frames().saturating_mul(self.stall_multiple as u64).max(1)
    }

    /// Check every field that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::ConfigError("url is required".into()));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(Error::ConfigError(format!(
                "viewport must be non-empty, got {}x{}",
                self.viewport.width, self.viewport.height
            )));
        }
        if self.viewport.frame_size().is_none() {
            return Err(Error::ConfigError("viewport too large".into()));
        }
        if self.fps == 0 {
            return Err(Error::ConfigError("fps must be at least 1".into()));
        }
        if self.duration_seconds == 0 {
            return Err(Error::ConfigError("duration must be at least 1 second".into()));
        }
        // frame names carry a fixed-width index; past it lexical order breaks
        let max_frames = 10u64.pow(writer::FRAME_INDEX_WIDTH as u32);
        if self.target_frames() > max_frames {
            return Err(Error::ConfigError(format!(
                "{} frames requested, at most {} fit the frame file names",
                self.target_frames(),
                max_frames
            )));
        }
        if self.writer_threads == 0 {
            return Err(Error::ConfigError("at least one writer thread is required".into()));
        }
        if self.pool_size == 0 {
            return Err(Error::ConfigError("pool size must be at least 1".into()));
        }
        Ok(())
    }
}
