//! End-to-end captures against the built-in pattern renderer

use rfcapture::encode::decode_png_to_bgra;
use rfcapture::renderer::pattern::{PatternOptions, PatternRenderer};
use rfcapture::{CaptureConfig, CaptureMode, CaptureSession, PacingStrategy, Viewport};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

fn frame_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read output dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    files.sort();
    files
}

fn fingerprint(path: &Path) -> String {
    hex::encode(Sha256::digest(fs::read(path).expect("read frame")))
}

fn capture(config: CaptureConfig, options: PatternOptions) -> (rfcapture::CaptureReport, bool) {
    let mut session = CaptureSession::new(config, Box::new(PatternRenderer::new(options)))
        .expect("valid config");
    session.initialize().expect("initialize");
    let report = session.record().expect("record");
    let closed = session.shutdown();
    (report, closed)
}

fn small_config(dir: &Path) -> CaptureConfig {
    CaptureConfig {
        url: "pattern://bars".into(),
        output_dir: dir.to_path_buf(),
        viewport: Viewport { width: 64, height: 32 },
        duration_seconds: 1,
        fps: 10,
        ..Default::default()
    }
}

#[test]
fn test_raw_capture_720p() {
    let dir = tempfile::tempdir().unwrap();
    let config = CaptureConfig {
        url: "pattern://bars".into(),
        output_dir: dir.path().to_path_buf(),
        viewport: Viewport { width: 1280, height: 720 },
        duration_seconds: 2,
        fps: 30,
        ..Default::default()
    };

    let (report, closed) = capture(config, PatternOptions::default());
    assert!(report.is_complete(), "{:?}", report);
    assert!(closed);
    assert_eq!(report.written_frames, 60);

    let files = frame_files(dir.path());
    assert_eq!(files.len(), 60);
    for (i, file) in files.iter().enumerate() {
        assert_eq!(file.file_name().unwrap().to_string_lossy(), format!("frame-{:06}.bgra", i));
        assert_eq!(fs::metadata(file).unwrap().len(), 1280 * 720 * 4);
    }
    // the bar moves between frames
    assert_ne!(fingerprint(&files[0]), fingerprint(&files[59]));
}

#[test]
fn test_virtual_time_capture_is_deterministic() {
    let first = tempfile::tempdir().unwrap();
    let second = tempfile::tempdir().unwrap();

    let (a, _) = capture(small_config(first.path()), PatternOptions::default());
    let (b, _) = capture(small_config(second.path()), PatternOptions::default());
    assert!(a.is_complete() && b.is_complete());

    let left: Vec<String> = frame_files(first.path()).iter().map(|f| fingerprint(f)).collect();
    let right: Vec<String> = frame_files(second.path()).iter().map(|f| fingerprint(f)).collect();
    assert_eq!(left.len(), 10);
    assert_eq!(left, right);
}

#[test]
fn test_png_capture() {
    let dir = tempfile::tempdir().unwrap();
    let config = CaptureConfig {
        mode: CaptureMode::Png,
        ..small_config(dir.path())
    };

    let (report, _) = capture(config, PatternOptions::default());
    assert!(report.is_complete(), "{:?}", report);

    let files = frame_files(dir.path());
    assert_eq!(files.len(), 10);
    assert!(files.iter().all(|f| f.extension().unwrap() == "png"));

    let (pixels, width, height) = decode_png_to_bgra(&fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!((width, height), (64, 32));
    assert_eq!(pixels.len(), 64 * 32 * 4);
    assert!(pixels.chunks_exact(4).all(|px| px[3] == 255));
}

#[test]
fn test_stray_paint_is_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let options = PatternOptions {
        stray_paint_on_create: true,
        ..Default::default()
    };

    let (report, _) = capture(small_config(dir.path()), options);
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(report.accepted_frames, 10);

    let files = frame_files(dir.path());
    assert_eq!(files.len(), 10);
    assert!(files.iter().all(|f| fs::metadata(f).unwrap().len() == 64 * 32 * 4));
}

#[test]
fn test_stalled_renderer_gives_up() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CaptureConfig {
        fps: 1,
        ..small_config(dir.path())
    };
    config.timeouts.step_ack_ms = 20;
    config.timeouts.step_frame_ms = 20;
    config.timeouts.drain_ms = 50;
    config.timeouts.close_ms = 500;
    let options = PatternOptions {
        paints: false,
        ..Default::default()
    };

    let start = Instant::now();
    let (report, closed) = capture(config, options);

    assert!(!report.is_complete());
    assert!(report.stalled);
    assert_eq!(report.accepted_frames, 0);
    assert_eq!(report.steps, 3);
    assert!(closed);
    assert!(frame_files(dir.path()).is_empty());
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_interval_pacing() {
    let dir = tempfile::tempdir().unwrap();
    let config = CaptureConfig {
        pacing: PacingStrategy::Interval,
        fps: 20,
        ..small_config(dir.path())
    };

    let (report, _) = capture(config, PatternOptions::default());
    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(frame_files(dir.path()).len(), 20);
}
