//! Capture through headless Chrome

#![cfg(feature = "cdp")]

use rfcapture::renderer::{new_renderer, Backend};
use rfcapture::{CaptureConfig, CaptureMode, CaptureSession, Viewport};
use tiny_http::{Response, Server};

const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Moving box</title>
<style>
  body { margin: 0; background: #202040; }
  #box { width: 40px; height: 40px; background: #f0a000; position: absolute; animation: slide 1s linear infinite; }
  @keyframes slide { from { left: 0; } to { left: 280px; } }
</style>
</head>
<body><div id="box"></div></body>
</html>"#;

#[test]
#[ignore] // Requires Chrome to be installed
fn test_cdp_png_capture() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr();
    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = Response::from_string(PAGE).with_header(
                "Content-Type: text/html; charset=utf-8"
                    .parse::<tiny_http::Header>()
                    .unwrap(),
            );
            let _ = request.respond(response);
        }
    });

    let dir = tempfile::tempdir().unwrap();
    let config = CaptureConfig {
        url: format!("http://{}/", addr),
        output_dir: dir.path().to_path_buf(),
        viewport: Viewport { width: 320, height: 240 },
        duration_seconds: 1,
        fps: 5,
        mode: CaptureMode::Png,
        ..Default::default()
    };

    let renderer = new_renderer(Backend::Cdp).expect("cdp backend");
    let mut session = CaptureSession::new(config, renderer).expect("config");
    session.initialize().expect("Failed to load test page");
    let report = session.record().expect("record");
    session.shutdown();

    assert!(report.is_complete(), "{:?}", report);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 5);
}
