//! Renderer capability set.
//!
//! The browser engine is a black box. We drive it through [`Renderer`] and it
//! talks back through [`RenderClient`]. Every callback happens on the thread
//! that calls into the renderer (normally from inside [`Renderer::pump_once`]
//! or one of the request methods), so anything waiting on the renderer must
//! keep pumping it; [`pump_until`] is the one place that does that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::devtools::MessageId;
use crate::{Error, Result, Viewport};

#[cfg(feature = "cdp")]
pub mod cdp;
pub mod pattern;

/// Which surface a paint belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaintElementKind {
    /// The main view
    View,
    /// Popup widgets (select menus and the like)
    Popup,
}

/// Callbacks the renderer invokes. Implementations must return promptly.
pub trait RenderClient: Send + Sync {
    /// The render surface exists and accepts requests.
    fn on_surface_created(&self);

    /// A frame was painted. `buffer` is premultiplied BGRA, `width * height * 4`
    /// bytes, or `None` when the engine had nothing to hand over.
    fn on_paint(&self, kind: PaintElementKind, buffer: Option<&[u8]>, width: u32, height: u32);

    /// The main frame finished loading.
    fn on_main_frame_load_complete(&self);

    /// Result of an earlier [`Renderer::execute_devtools_method`] call.
    fn on_devtools_result(&self, id: MessageId, success: bool);

    /// A DevTools protocol event.
    fn on_devtools_event(&self, method: &str);

    /// The surface is gone; no further callbacks follow.
    fn on_before_close(&self);
}

/// Control surface of a headless renderer.
pub trait Renderer {
    /// Create an off-screen surface of `viewport` size. Completion is reported
    /// through [`RenderClient::on_surface_created`].
    fn create_surface(
        &mut self,
        viewport: Viewport,
        target_fps: u32,
        client: Arc<dyn RenderClient>,
    ) -> Result<()>;

    /// Start loading `url` in the main frame.
    fn navigate(&mut self, url: &str) -> Result<()>;

    /// Run one non-blocking iteration of the renderer's event processing.
    fn pump_once(&mut self);

    /// Mark the whole view dirty.
    fn invalidate(&mut self);

    /// Ask for one externally driven frame.
    fn request_external_frame_tick(&mut self);

    /// Send a DevTools protocol request. Returns the message id the result
    /// will carry, or `None` if the surface does not exist.
    fn execute_devtools_method(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Option<MessageId>;

    /// Request the surface be closed. Confirmation arrives through
    /// [`RenderClient::on_before_close`].
    fn close(&mut self);
}

/// Pump `renderer` until `done` returns true or `timeout` elapses. The
/// condition is checked once more after the deadline.
pub fn pump_until(
    renderer: &mut dyn Renderer,
    timeout: Duration,
    mut done: impl FnMut() -> bool,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        renderer.pump_once();
        std::thread::yield_now();
    }
    done()
}

/// Available renderer backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Built-in deterministic test-pattern renderer
    #[default]
    Pattern,
    /// Headless Chrome over the DevTools protocol (feature `cdp`)
    Cdp,
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pattern" => Ok(Backend::Pattern),
            "cdp" | "chrome" => Ok(Backend::Cdp),
            other => Err(Error::ConfigError(format!("unknown renderer backend '{}'", other))),
        }
    }
}

/// Create a renderer for `backend`.
pub fn new_renderer(backend: Backend) -> Result<Box<dyn Renderer>> {
    match backend {
        Backend::Pattern => Ok(Box::new(pattern::PatternRenderer::new(
            pattern::PatternOptions::default(),
        ))),
        #[cfg(feature = "cdp")]
        Backend::Cdp => Ok(Box::new(cdp::CdpRenderer::new())),
        #[cfg(not(feature = "cdp"))]
        Backend::Cdp => Err(Error::ConfigError(
            "the cdp backend requires building with `--features cdp`".into(),
        )),
    }
}
