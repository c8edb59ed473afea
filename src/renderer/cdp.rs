//! Headless Chrome backend over the DevTools protocol.
//!
//! Chrome does not hand us paint callbacks, so a frame is a PNG screenshot of
//! the tab, decoded and converted to premultiplied BGRA before it reaches the
//! client. Protocol calls are blocking in `headless_chrome`; their results and
//! any protocol events are queued and delivered on the next pump like every
//! other renderer notification.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use headless_chrome::browser::tab::Tab;
use headless_chrome::protocol::cdp::types::{Event, Method};
use headless_chrome::protocol::cdp::{Emulation, Page};
use headless_chrome::{Browser, LaunchOptions};
use log::warn;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{PaintElementKind, RenderClient, Renderer};
use crate::devtools::{MessageId, PAGE_ENABLE, SET_VIRTUAL_TIME_POLICY};
use crate::{encode, Error, Result, Viewport};

const SET_DEVICE_METRICS_OVERRIDE: &str = "Emulation.setDeviceMetricsOverride";

enum Pending {
    SurfaceCreated,
    LoadComplete,
    Result(MessageId, bool),
    Event(String),
    Closed,
}

type PendingQueue = Arc<Mutex<VecDeque<Pending>>>;

/// Renderer backed by one headless Chrome tab
pub struct CdpRenderer {
    browser: Option<Browser>,
    tab: Option<Arc<Tab>>,
    client: Option<Arc<dyn RenderClient>>,
    viewport: Viewport,
    pending: PendingQueue,
    next_message_id: MessageId,
    dirty: bool,
    closing: bool,
}

impl Default for CdpRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl CdpRenderer {
    pub fn new() -> Self {
        Self {
            browser: None,
            tab: None,
            client: None,
            viewport: Viewport::default(),
            pending: Arc::new(Mutex::new(VecDeque::new())),
            next_message_id: 1,
            dirty: false,
            closing: false,
        }
    }

    fn live_tab(&self) -> Option<Arc<Tab>> {
        if self.closing {
            return None;
        }
        self.tab.clone()
    }

    fn capture_frame(&mut self) {
        let (Some(tab), Some(client)) = (self.live_tab(), self.client.clone()) else {
            return;
        };
        self.dirty = false;

        let png = match tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true) {
            Ok(png) => png,
            Err(e) => {
                warn!("Screenshot failed: {}", e);
                return;
            }
        };
        match encode::decode_png_to_bgra(&png) {
            Ok((pixels, width, height)) => {
                if (width, height) != (self.viewport.width, self.viewport.height) {
                    log::debug!(
                        "screenshot is {}x{}, surface is {}x{}",
                        width,
                        height,
                        self.viewport.width,
                        self.viewport.height
                    );
                }
                client.on_paint(PaintElementKind::View, Some(pixels.as_slice()), width, height)
            }
            Err(e) => warn!("Undecodable screenshot: {}", e),
        }
    }
}

/// Deserialize `params` into the typed protocol request `M` and send it.
fn call<M>(tab: &Tab, params: serde_json::Value) -> Result<()>
where
    M: Method + Serialize + DeserializeOwned + Debug,
{
    let method: M = serde_json::from_value(params)
        .map_err(|e| Error::CdpError(format!("bad parameters: {}", e)))?;
    tab.call_method(method)?;
    Ok(())
}

fn dispatch(tab: &Tab, method: &str, params: serde_json::Value) -> Result<()> {
    match method {
        PAGE_ENABLE => call::<Page::Enable>(tab, params),
        SET_VIRTUAL_TIME_POLICY => call::<Emulation::SetVirtualTimePolicy>(tab, params),
        SET_DEVICE_METRICS_OVERRIDE => call::<Emulation::SetDeviceMetricsOverride>(tab, params),
        other => Err(Error::CdpError(format!("unsupported method {}", other))),
    }
}

impl Renderer for CdpRenderer {
    fn create_surface(
        &mut self,
        viewport: Viewport,
        _target_fps: u32,
        client: Arc<dyn RenderClient>,
    ) -> Result<()> {
        let launch_options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((viewport.width, viewport.height)))
            .build()
            .map_err(|e| Error::InitializationError(format!("Failed to build launch options: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| Error::InitializationError(format!("Failed to launch browser: {}", e)))?;

        let tab = browser
            .new_tab()
            .map_err(|e| Error::InitializationError(format!("Failed to create tab: {}", e)))?;

        // screenshots must come out at exactly the viewport size
        dispatch(
            &tab,
            SET_DEVICE_METRICS_OVERRIDE,
            serde_json::json!({
                "width": viewport.width,
                "height": viewport.height,
                "deviceScaleFactor": 1.0,
                "mobile": false,
            }),
        )
        .map_err(|e| Error::InitializationError(format!("Failed to set viewport: {}", e)))?;

        let events = Arc::clone(&self.pending);
        tab.add_event_listener(Arc::new(move |event: &Event| {
            // protocol events serialize with their method name as the tag
            if let Ok(value) = serde_json::to_value(event) {
                if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                    events.lock().push_back(Pending::Event(method.to_string()));
                }
            }
        }))
        .map_err(|e| Error::InitializationError(format!("Failed to listen for events: {}", e)))?;

        self.viewport = viewport;
        self.browser = Some(browser);
        self.tab = Some(tab);
        self.client = Some(client);
        self.closing = false;
        self.pending.lock().push_back(Pending::SurfaceCreated);
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        let tab = self
            .live_tab()
            .ok_or_else(|| Error::RenderError("navigate called without a surface".into()))?;

        tab.navigate_to(url)
            .map_err(|e| Error::LoadError(format!("Navigation failed: {}", e)))?;
        tab.wait_until_navigated()
            .map_err(|e| Error::LoadError(format!("Wait for navigation failed: {}", e)))?;

        self.pending.lock().push_back(Pending::LoadComplete);
        Ok(())
    }

    fn pump_once(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };

        let drained: Vec<Pending> = self.pending.lock().drain(..).collect();
        for event in drained {
            match event {
                Pending::SurfaceCreated => client.on_surface_created(),
                Pending::LoadComplete => client.on_main_frame_load_complete(),
                Pending::Result(id, ok) => client.on_devtools_result(id, ok),
                Pending::Event(method) => client.on_devtools_event(&method),
                Pending::Closed => {
                    self.pending.lock().clear();
                    self.tab = None;
                    // dropping the browser terminates the Chrome process
                    self.browser = None;
                    self.client = None;
                    client.on_before_close();
                    return;
                }
            }
        }

        if self.dirty {
            self.capture_frame();
        }
    }

    fn invalidate(&mut self) {
        if self.live_tab().is_some() {
            self.dirty = true;
        }
    }

    fn request_external_frame_tick(&mut self) {
        self.capture_frame();
    }

    fn execute_devtools_method(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Option<MessageId> {
        let tab = self.live_tab()?;
        let id = self.next_message_id;
        self.next_message_id += 1;

        let ok = match dispatch(&tab, method, params) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} failed: {}", method, e);
                false
            }
        };
        // events raised by the call were queued by the listener already; the
        // result goes in front of them
        let mut pending = self.pending.lock();
        let at = pending.len()
            - pending
                .iter()
                .rev()
                .take_while(|p| matches!(p, Pending::Event(_)))
                .count();
        pending.insert(at, Pending::Result(id, ok));
        Some(id)
    }

    fn close(&mut self) {
        if self.client.is_some() && !self.closing {
            self.closing = true;
            self.pending.lock().push_back(Pending::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_need_a_surface() {
        let mut renderer = CdpRenderer::new();
        assert!(renderer
            .execute_devtools_method(PAGE_ENABLE, serde_json::json!({}))
            .is_none());
        assert!(renderer.navigate("about:blank").is_err());
        renderer.pump_once();
    }

    #[test]
    fn test_cdp_surface_creation() {
        // This test requires Chrome to be installed, so we skip it in CI
        if std::env::var("CI").is_ok() {
            return;
        }
        struct Nop;
        impl RenderClient for Nop {
            fn on_surface_created(&self) {}
            fn on_paint(&self, _: PaintElementKind, _: Option<&[u8]>, _: u32, _: u32) {}
            fn on_main_frame_load_complete(&self) {}
            fn on_devtools_result(&self, _: MessageId, _: bool) {}
            fn on_devtools_event(&self, _: &str) {}
            fn on_before_close(&self) {}
        }

        let mut renderer = CdpRenderer::new();
        let viewport = Viewport { width: 320, height: 240 };
        if let Err(e) = renderer.create_surface(viewport, 30, Arc::new(Nop)) {
            eprintln!("Skipping CDP surface test because Chrome is not available or failed to launch: {}", e);
            return;
        }
        assert!(renderer
            .execute_devtools_method(PAGE_ENABLE, serde_json::json!({}))
            .is_some());
        renderer.close();
        renderer.pump_once();
        assert!(renderer.tab.is_none());
    }
}
