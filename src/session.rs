//! Capture session controller.
//!
//! Owns the renderer for the whole session and wires the other pieces
//! together: surface and page load in [`CaptureSession::initialize`], the
//! pacing loop and writer flush in [`CaptureSession::record`], and teardown
//! in [`CaptureSession::shutdown`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bridge::{build_sink, CaptureClient, FrameBridge};
use crate::devtools::{SetVirtualTimePolicy, PAGE_ENABLE, SET_VIRTUAL_TIME_POLICY};
use crate::pacer::{new_pacer, Pacer};
use crate::pool::FramePool;
use crate::renderer::{pump_until, RenderClient, Renderer};
use crate::writer::FrameWriter;
use crate::{CaptureConfig, CaptureMode, Error, PacingStrategy, Result, SessionTimeouts};

/// Totals of one recording
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub target_frames: u64,
    pub accepted_frames: u64,
    pub written_frames: u64,
    pub failed_writes: u64,
    /// Frames that could not be handed to the writer in time
    pub dropped_frames: u64,
    /// Frame requests the pacer issued
    pub steps: u64,
    /// The pacer hit its stall limit
    pub stalled: bool,
    /// Wall-clock time from recording start to flush
    pub elapsed: Duration,
}

impl CaptureReport {
    /// Exactly the target number of frames was captured and all of them are on disk.
    pub fn is_complete(&self) -> bool {
        self.accepted_frames == self.target_frames
            && self.written_frames == self.accepted_frames
            && self.failed_writes == 0
    }

    pub fn average_frame_time(&self) -> Option<Duration> {
        u32::try_from(self.accepted_frames)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.elapsed / n)
    }
}

/// One capture of one page
pub struct CaptureSession {
    config: CaptureConfig,
    renderer: Box<dyn Renderer>,
    pacer: Box<dyn Pacer>,
    client: Option<Arc<CaptureClient>>,
    writer: Option<Arc<FrameWriter>>,
    pool: Option<FramePool>,
    recorded: bool,
    shut_down: bool,
}

impl CaptureSession {
    /// Validate `config` and take ownership of `renderer`. Nothing is started yet.
    pub fn new(config: CaptureConfig, renderer: Box<dyn Renderer>) -> Result<Self> {
        config.validate()?;
        let pacer = new_pacer(&config);
        Ok(Self {
            config,
            renderer,
            pacer,
            client: None,
            writer: None,
            pool: None,
            recorded: false,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// The renderer-facing client, once initialized
    pub fn client(&self) -> Option<&Arc<CaptureClient>> {
        self.client.as_ref()
    }

    /// Create the render surface, load the page and wait for both.
    pub fn initialize(&mut self) -> Result<()> {
        if self.client.is_some() || self.shut_down {
            return Err(Error::InitializationError("session already initialized".into()));
        }
        let cfg = &self.config;
        let timeouts = cfg.timeouts;

        let writer = match cfg.mode {
            CaptureMode::Raw => {
                let pool = FramePool::new(cfg.pool_size, cfg.frame_size())?;
                let writer = Arc::new(FrameWriter::new(&cfg.output_dir, pool.clone(), cfg.writer_threads)?);
                self.pool = Some(pool);
                self.writer = Some(writer.clone());
                Some(writer)
            }
            CaptureMode::Png => None,
        };
        let sink = build_sink(
            cfg.mode,
            cfg.output_dir.clone(),
            writer,
            SessionTimeouts::ms(timeouts.pool_acquire_ms),
        )?;
        let client = Arc::new(CaptureClient::new(FrameBridge::new(
            cfg.viewport,
            cfg.target_frames(),
            sink,
        )));
        self.client = Some(client.clone());

        log::info!(
            "Creating {}x{} surface for {}",
            cfg.viewport.width,
            cfg.viewport.height,
            cfg.url
        );
        let render_client: Arc<dyn RenderClient> = client.clone();
        self.renderer.create_surface(cfg.viewport, cfg.fps, render_client)?;
        if !pump_until(self.renderer.as_mut(), SessionTimeouts::ms(timeouts.surface_ms), || {
            client.has_surface()
        }) {
            return Err(Error::Timeout {
                what: "render surface creation",
                timeout_ms: timeouts.surface_ms,
            });
        }

        self.renderer
            .navigate(&cfg.url)
            .map_err(|e| Error::LoadError(format!("{}: {}", cfg.url, e)))?;
        if !pump_until(self.renderer.as_mut(), SessionTimeouts::ms(timeouts.load_ms), || {
            client.is_load_complete()
        }) {
            return Err(Error::Timeout {
                what: "main frame load",
                timeout_ms: timeouts.load_ms,
            });
        }

        log::info!("Page loaded: {}", cfg.url);
        Ok(())
    }

    /// Send a setup request and wait for its result. Failures are logged only.
    fn setup_request(&mut self, client: &CaptureClient, method: &str, params: serde_json::Value) {
        let timeout_ms = self.config.timeouts.setup_ms;
        let Some(id) = self.renderer.execute_devtools_method(method, params) else {
            log::warn!("{} not sent, no render surface", method);
            return;
        };
        match client
            .devtools()
            .wait_for_result(self.renderer.as_mut(), id, SessionTimeouts::ms(timeout_ms))
        {
            Some(true) => log::debug!("{} ok", method),
            Some(false) => log::warn!("{} failed", method),
            None => log::warn!("{} not answered within {} ms", method, timeout_ms),
        }
    }

    /// Record the page. Returns the totals; check [`CaptureReport::is_complete`]
    /// for whether exactly the target number of frames landed on disk.
    pub fn record(&mut self) -> Result<CaptureReport> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| Error::InitializationError("record called before initialize".into()))?;
        if self.recorded || self.shut_down {
            return Err(Error::Other("session has already recorded".into()));
        }
        self.recorded = true;

        if self.config.pacing == PacingStrategy::VirtualTime {
            self.setup_request(&client, PAGE_ENABLE, serde_json::json!({}));
            self.setup_request(
                &client,
                SET_VIRTUAL_TIME_POLICY,
                SetVirtualTimePolicy::paused_at_start().to_params(),
            );
        }

        let bridge = client.bridge();
        let target = bridge.target_frames();
        log::info!("Recording {} frames @ {} fps", target, self.config.fps);

        let started = Instant::now();
        bridge.start_recording();
        let outcome = self.pacer.run(self.renderer.as_mut(), &client);
        bridge.stop_recording();
        if let Some(writer) = &self.writer {
            writer.flush();
        }
        let elapsed = started.elapsed();

        let report = CaptureReport {
            target_frames: target,
            accepted_frames: bridge.accepted_frames(),
            written_frames: bridge.written_frames(),
            failed_writes: bridge.failed_writes(),
            dropped_frames: bridge.dropped_frames(),
            steps: outcome.steps,
            stalled: outcome.stalled,
            elapsed,
        };

        log::info!(
            "Total time: {:.2} s, average frame time: {:.2} ms, frames written: {}/{}",
            elapsed.as_secs_f64(),
            report
                .average_frame_time()
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0),
            report.written_frames,
            target
        );
        if !report.is_complete() {
            log::warn!(
                "Incomplete capture: {} accepted, {} written, {} failed, {} dropped of {}",
                report.accepted_frames,
                report.written_frames,
                report.failed_writes,
                report.dropped_frames,
                target
            );
        }
        Ok(report)
    }

    /// Close the renderer and release the writer and pool. Returns whether
    /// the renderer confirmed the close in time. Safe to call more than once.
    pub fn shutdown(&mut self) -> bool {
        if self.shut_down {
            return true;
        }
        self.shut_down = true;

        let mut closed = true;
        if let Some(client) = self.client.clone() {
            client.bridge().stop_recording();
            if !client.is_closed() {
                self.renderer.close();
            }
            if !client.surface_was_created() {
                log::debug!("no render surface was created, not waiting for close");
            } else if !client.is_closed() {
                let close_ms = self.config.timeouts.close_ms;
                closed = pump_until(self.renderer.as_mut(), SessionTimeouts::ms(close_ms), || {
                    client.is_closed()
                });
                if !closed {
                    log::warn!("renderer did not confirm close within {} ms", close_ms);
                }
            }
        }

        if let Some(writer) = self.writer.take() {
            writer.shutdown();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        log::debug!("capture session shut down");
        closed
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::pattern::{PatternOptions, PatternRenderer};
    use crate::Viewport;

    fn config(dir: &std::path::Path) -> CaptureConfig {
        CaptureConfig {
            url: "pattern://test".into(),
            output_dir: dir.to_path_buf(),
            viewport: Viewport { width: 32, height: 8 },
            duration_seconds: 1,
            fps: 10,
            writer_threads: 2,
            pool_size: 4,
            ..Default::default()
        }
    }

    fn session(cfg: CaptureConfig, options: PatternOptions) -> CaptureSession {
        CaptureSession::new(cfg, Box::new(PatternRenderer::new(options))).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CaptureConfig {
            fps: 0,
            ..config(dir.path())
        };
        let renderer = Box::new(PatternRenderer::new(PatternOptions::default()));
        assert!(matches!(CaptureSession::new(cfg, renderer), Err(Error::ConfigError(_))));
    }

    #[test]
    fn record_requires_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path()), PatternOptions::default());
        assert!(matches!(s.record(), Err(Error::InitializationError(_))));
        assert!(s.shutdown());
    }

    #[test]
    fn load_timeout_fails_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.timeouts.load_ms = 30;
        let mut s = session(
            cfg,
            PatternOptions {
                completes_load: false,
                ..Default::default()
            },
        );

        let err = s.initialize().unwrap_err();
        assert!(matches!(err, Error::Timeout { what: "main frame load", .. }));
        assert!(s.shutdown());
    }

    #[test]
    fn records_the_target_frame_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(config(dir.path()), PatternOptions::default());
        s.initialize().unwrap();

        let report = s.record().unwrap();
        assert!(report.is_complete(), "{:?}", report);
        assert_eq!(report.accepted_frames, 10);
        assert_eq!(report.steps, 10);
        assert!(report.average_frame_time().is_some());

        assert!(s.record().is_err());
        assert!(s.shutdown());
        assert!(s.shutdown());
        assert!(s.client().unwrap().is_closed());
    }

    /// A backend whose browser never starts.
    struct Unlaunchable;

    impl Renderer for Unlaunchable {
        fn create_surface(&mut self, _: crate::Viewport, _: u32, _: Arc<dyn RenderClient>) -> Result<()> {
            Err(Error::InitializationError("browser did not start".into()))
        }
        fn navigate(&mut self, _: &str) -> Result<()> {
            Ok(())
        }
        fn pump_once(&mut self) {}
        fn invalidate(&mut self) {}
        fn request_external_frame_tick(&mut self) {}
        fn execute_devtools_method(&mut self, _: &str, _: serde_json::Value) -> Option<crate::devtools::MessageId> {
            None
        }
        fn close(&mut self) {}
    }

    #[test]
    fn shutdown_skips_the_close_wait_without_a_surface() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.timeouts.close_ms = 5_000;
        let mut s = CaptureSession::new(cfg, Box::new(Unlaunchable)).unwrap();

        assert!(matches!(s.initialize(), Err(Error::InitializationError(_))));
        let start = Instant::now();
        assert!(s.shutdown());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!s.client().unwrap().surface_was_created());
    }

    #[test]
    fn report_completeness() {
        let full = CaptureReport {
            target_frames: 3,
            accepted_frames: 3,
            written_frames: 3,
            failed_writes: 0,
            dropped_frames: 0,
            steps: 3,
            stalled: false,
            elapsed: Duration::from_millis(30),
        };
        assert!(full.is_complete());
        assert_eq!(full.average_frame_time(), Some(Duration::from_millis(10)));
        assert!(!CaptureReport { written_frames: 2, failed_writes: 1, ..full.clone() }.is_complete());
        assert!(!CaptureReport { accepted_frames: 2, written_frames: 2, ..full.clone() }.is_complete());
        assert_eq!(
            CaptureReport { accepted_frames: 0, ..full }.average_frame_time(),
            None
        );
    }
}
