//! Deterministic test-pattern renderer.
//!
//! Needs no browser. Paints a horizontal gradient with a white bar that moves
//! 250 px per second of page time, so consecutive frames differ and the same
//! virtual time always yields the same pixels. Lifecycle notifications and
//! DevTools results are queued and delivered on the next [`pump_once`], the
//! way a real engine reports them asynchronously.
//!
//! [`pump_once`]: Renderer::pump_once

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use super::{PaintElementKind, RenderClient, Renderer};
use crate::devtools::{
    MessageId, SetVirtualTimePolicy, VirtualTimePolicy, PAGE_ENABLE, SET_VIRTUAL_TIME_POLICY,
    VIRTUAL_TIME_BUDGET_EXPIRED,
};
use crate::{Error, Result, Viewport};

/// Pixels the bar travels per second of page time
pub const BAR_SPEED_PX_PER_SEC: u64 = 250;
const BAR_WIDTH: usize = 16;

/// Knobs for simulating renderer behaviour in tests
#[derive(Debug, Clone)]
pub struct PatternOptions {
    /// Emit a 1x1 paint right after the surface is created
    pub stray_paint_on_create: bool,
    /// Pumps between `navigate` and the load-complete signal
    pub load_delay_pumps: u32,
    /// Whether the page ever finishes loading
    pub completes_load: bool,
    /// Whether ticks and invalidations produce paints at all
    pub paints: bool,
    /// Whether DevTools requests are ever answered
    pub answers_devtools: bool,
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self {
            stray_paint_on_create: false,
            load_delay_pumps: 2,
            completes_load: true,
            paints: true,
            answers_devtools: true,
        }
    }
}

enum Pending {
    SurfaceCreated,
    StrayPaint,
    Result(MessageId, bool),
    Event(&'static str),
    Closed,
}

pub struct PatternRenderer {
    options: PatternOptions,
    client: Option<Arc<dyn RenderClient>>,
    viewport: Viewport,
    surface: Vec<u8>,
    row: Vec<u8>,
    pending: VecDeque<Pending>,
    load_countdown: Option<u32>,
    url: Option<String>,
    dirty: bool,
    closing: bool,
    // None until a virtual-time policy is applied; wall clock drives the pattern until then
    virtual_time_ms: Option<u64>,
    created_at: Instant,
    next_message_id: MessageId,
    frames_painted: u64,
}

impl PatternRenderer {
    pub fn new(options: PatternOptions) -> Self {
        Self {
            options,
            client: None,
            viewport: Viewport { width: 0, height: 0 },
            surface: Vec::new(),
            row: Vec::new(),
            pending: VecDeque::new(),
            load_countdown: None,
            url: None,
            dirty: false,
            closing: false,
            virtual_time_ms: None,
            created_at: Instant::now(),
            next_message_id: 1,
            frames_painted: 0,
        }
    }

    /// Page time in ms, if virtual time is under our control
    pub fn virtual_time_ms(&self) -> Option<u64> {
        self.virtual_time_ms
    }

    pub fn frames_painted(&self) -> u64 {
        self.frames_painted
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn is_live(&self) -> bool {
        self.client.is_some() && !self.closing
    }

    fn page_time_ms(&self) -> u64 {
        self.virtual_time_ms
            .unwrap_or_else(|| self.created_at.elapsed().as_millis() as u64)
    }

    fn paint(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        if !self.options.paints || self.closing {
            return;
        }

        let width = self.viewport.width as usize;
        let height = self.viewport.height as usize;
        let bar_x = ((self.page_time_ms() * BAR_SPEED_PX_PER_SEC / 1000) as usize) % width.max(1);

        for x in 0..width {
            let px = &mut self.row[x * 4..x * 4 + 4];
            if x >= bar_x && x < bar_x + BAR_WIDTH {
                px.copy_from_slice(&[255, 255, 255, 255]);
            } else {
                let shade = (x * 255 / width.max(1)) as u8;
                px.copy_from_slice(&[shade, 64, 255 - shade, 255]);
            }
        }
        for line in self.surface.chunks_exact_mut(width * 4).take(height) {
            line.copy_from_slice(&self.row);
        }

        self.dirty = false;
        self.frames_painted += 1;
        client.on_paint(
            PaintElementKind::View,
            Some(self.surface.as_slice()),
            self.viewport.width,
            self.viewport.height,
        );
    }

    fn apply_devtools(&mut self, method: &str, params: serde_json::Value) -> bool {
        match method {
            PAGE_ENABLE => true,
            SET_VIRTUAL_TIME_POLICY => {
                let request: SetVirtualTimePolicy = match serde_json::from_value(params) {
                    Ok(r) => r,
                    Err(e) => {
                        log::debug!("pattern renderer: bad virtual time params: {}", e);
                        return false;
                    }
                };
                let now = self.virtual_time_ms.unwrap_or(0);
                match request.policy {
                    VirtualTimePolicy::Advance => {
                        let budget = request.budget.unwrap_or(0.0).max(0.0).round() as u64;
                        self.virtual_time_ms = Some(now + budget);
                        self.pending.push_back(Pending::Event(VIRTUAL_TIME_BUDGET_EXPIRED));
                    }
                    VirtualTimePolicy::Pause | VirtualTimePolicy::PauseIfNetworkFetchesPending => {
                        let start = request
                            .initial_virtual_time
                            .map(|t| t.max(0.0) as u64)
                            .unwrap_or(now);
                        self.virtual_time_ms = Some(start);
                    }
                }
                true
            }
            other => {
                log::debug!("pattern renderer: unsupported devtools method {}", other);
                false
            }
        }
    }
}

impl Renderer for PatternRenderer {
    fn create_surface(
        &mut self,
        viewport: Viewport,
        _target_fps: u32,
        client: Arc<dyn RenderClient>,
    ) -> Result<()> {
        let frame_size = viewport
            .frame_size()
            .filter(|&n| n > 0)
            .ok_or_else(|| Error::ConfigError(format!("bad viewport {}x{}", viewport.width, viewport.height)))?;

        self.viewport = viewport;
        self.surface = vec![0u8; frame_size];
        self.row = vec![0u8; viewport.width as usize * 4];
        self.client = Some(client);
        self.closing = false;
        self.created_at = Instant::now();
        self.pending.push_back(Pending::SurfaceCreated);
        if self.options.stray_paint_on_create {
            self.pending.push_back(Pending::StrayPaint);
        }
        Ok(())
    }

    fn navigate(&mut self, url: &str) -> Result<()> {
        if !self.is_live() {
            return Err(Error::RenderError("navigate called without a surface".into()));
        }
        self.url = Some(url.to_string());
        self.load_countdown = self
            .options
            .completes_load
            .then_some(self.options.load_delay_pumps);
        Ok(())
    }

    fn pump_once(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };

        while let Some(event) = self.pending.pop_front() {
            match event {
                Pending::SurfaceCreated => client.on_surface_created(),
                Pending::StrayPaint => {
                    client.on_paint(PaintElementKind::View, Some(&[0u8, 0, 0, 255][..]), 1, 1)
                }
                Pending::Result(id, ok) => client.on_devtools_result(id, ok),
                Pending::Event(method) => client.on_devtools_event(method),
                Pending::Closed => {
                    self.pending.clear();
                    self.client = None;
                    client.on_before_close();
                    return;
                }
            }
        }

        if let Some(left) = self.load_countdown {
            if left == 0 {
                self.load_countdown = None;
                client.on_main_frame_load_complete();
            } else {
                self.load_countdown = Some(left - 1);
            }
        }

        if self.dirty {
            self.paint();
        }
    }

    fn invalidate(&mut self) {
        if self.is_live() {
            self.dirty = true;
        }
    }

    fn request_external_frame_tick(&mut self) {
        if self.is_live() {
            self.paint();
        }
    }

    fn execute_devtools_method(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Option<MessageId> {
        if !self.is_live() {
            return None;
        }
        let id = self.next_message_id;
        self.next_message_id += 1;

        if self.options.answers_devtools {
            let ok = self.apply_devtools(method, params);
            // the result precedes any event the request triggered
            let at = self.pending.len()
                - self
                    .pending
                    .iter()
                    .rev()
                    .take_while(|p| matches!(p, Pending::Event(_)))
                    .count();
            self.pending.insert(at, Pending::Result(id, ok));
        }
        Some(id)
    }

    fn close(&mut self) {
        if self.client.is_some() && !self.closing {
            self.closing = true;
            self.pending.push_back(Pending::Closed);
        }
    }
}
