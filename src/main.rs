//! `rfcapture` command-line tool.
//!
//! Records a page to a directory of numbered frames. Exits 0 when exactly the
//! requested number of frames was written, 1 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use rfcapture::renderer::{new_renderer, Backend};
use rfcapture::{CaptureConfig, CaptureMode, CaptureSession, PacingStrategy};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rfcapture", version, about = "Record a web page frame by frame")]
struct Args {
    /// Page to record
    #[arg(long)]
    url: Option<String>,

    /// Output directory
    #[arg(long, short)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Recording length in seconds
    #[arg(long)]
    duration: Option<u32>,

    #[arg(long)]
    fps: Option<u32>,

    /// Disk writer threads
    #[arg(long)]
    threads: Option<usize>,

    /// Pre-allocated frame buffers
    #[arg(long)]
    pool_size: Option<usize>,

    /// raw | png
    #[arg(long)]
    mode: Option<CaptureMode>,

    /// virtual-time | interval
    #[arg(long)]
    pacing: Option<PacingStrategy>,

    /// pattern | cdp
    #[arg(long, default_value = "pattern")]
    backend: Backend,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<(CaptureConfig, Backend)> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<CaptureConfig>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => CaptureConfig::default(),
        };

        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if let Some(width) = self.width {
            config.viewport.width = width;
        }
        if let Some(height) = self.height {
            config.viewport.height = height;
        }
        if let Some(duration) = self.duration {
            config.duration_seconds = duration;
        }
        if let Some(fps) = self.fps {
            config.fps = fps;
        }
        if let Some(threads) = self.threads {
            config.writer_threads = threads;
            if self.pool_size.is_none() {
                config.pool_size = threads * 2 + 2;
            }
        }
        if let Some(pool_size) = self.pool_size {
            config.pool_size = pool_size;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(pacing) = self.pacing {
            config.pacing = pacing;
        }
        Ok((config, self.backend))
    }
}

fn run(args: Args) -> Result<bool> {
    let (config, backend) = args.into_config()?;
    let renderer = new_renderer(backend).context("creating renderer")?;
    let mut session = CaptureSession::new(config, renderer).context("invalid configuration")?;

    session.initialize().context("initialization failed")?;
    let report = session.record().context("recording failed")?;
    if !session.shutdown() {
        log::warn!("renderer did not close cleanly");
    }

    log::info!(
        "{} of {} frames written to {}",
        report.written_frames,
        report.target_frames,
        session.config().output_dir.display()
    );
    Ok(report.is_complete())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            log::error!("capture incomplete");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
