//! Time-stepping drivers.
//!
//! A pacer owns the recording loop: it nudges the renderer forward, asks for a
//! frame and waits for the bridge's accepted-frame counter to move. Every wait
//! is bounded. A renderer that never delivers is handled by the consecutive
//! stall limit, after which the pacer gives up and reports an incomplete run.

use std::time::{Duration, Instant};

use crate::bridge::CaptureClient;
use crate::devtools::{SetVirtualTimePolicy, SET_VIRTUAL_TIME_POLICY};
use crate::renderer::{pump_until, Renderer};
use crate::{CaptureConfig, PacingStrategy, SessionTimeouts};

/// Per-step virtual time budgets that never drift.
///
/// Each budget is the distance from what has been requested so far to the
/// rounded ideal timestamp of the next frame, so rounding errors do not pile up
/// over long captures.
#[derive(Debug, Clone)]
pub struct StepBudget {
    fps: u32,
    accumulated_ms: u64,
}

impl StepBudget {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            accumulated_ms: 0,
        }
    }

    /// Budget for producing frame `frame_index`, at least 1 ms.
    pub fn next(&mut self, frame_index: u64) -> u64 {
        let target = ((frame_index + 1) as f64 * 1000.0 / self.fps as f64).round() as u64;
        let budget = target.saturating_sub(self.accumulated_ms).max(1);
        self.accumulated_ms += budget;
        budget
    }

    /// Virtual time requested so far
    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    Idle,
    Stepping,
    Draining,
    Done,
}

/// What a pacing run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceOutcome {
    pub state: PacerState,
    /// Frame requests issued
    pub steps: u64,
    /// The stall limit was hit before the target
    pub stalled: bool,
}

/// Knobs shared by every pacer
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub target_frames: u64,
    pub fps: u32,
    pub stall_limit: u64,
    pub step_ack: Duration,
    pub step_frame: Duration,
    pub drain: Duration,
    pub await_budget_expiry: bool,
}

impl From<&CaptureConfig> for PacerSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            target_frames: config.target_frames(),
            fps: config.fps,
            stall_limit: config.stall_limit(),
            step_ack: SessionTimeouts::ms(config.timeouts.step_ack_ms),
            step_frame: SessionTimeouts::ms(config.timeouts.step_frame_ms),
            drain: SessionTimeouts::ms(config.timeouts.drain_ms),
            await_budget_expiry: config.await_budget_expiry,
        }
    }
}

/// A recording loop. Runs on the renderer's thread; recording must already be
/// enabled on the client's bridge.
pub trait Pacer {
    fn run(&mut self, renderer: &mut dyn Renderer, client: &CaptureClient) -> PaceOutcome;

    fn state(&self) -> PacerState;
}

/// Pacer for `config.pacing`
pub fn new_pacer(config: &CaptureConfig) -> Box<dyn Pacer> {
    let settings = PacerSettings::from(config);
    match config.pacing {
        PacingStrategy::VirtualTime => Box::new(VirtualTimePacer::new(settings)),
        PacingStrategy::Interval => Box::new(IntervalPacer::new(settings)),
    }
}

fn drain(renderer: &mut dyn Renderer, client: &CaptureClient, settings: &PacerSettings) {
    let bridge = client.bridge();
    if !pump_until(renderer, settings.drain, || {
        bridge.accepted_frames() >= settings.target_frames
    }) {
        log::debug!(
            "drain ended with {}/{} frames",
            bridge.accepted_frames(),
            settings.target_frames
        );
    }
}

/// Steps the renderer's virtual clock one frame interval at a time.
pub struct VirtualTimePacer {
    settings: PacerSettings,
    state: PacerState,
}

impl VirtualTimePacer {
    pub fn new(settings: PacerSettings) -> Self {
        Self {
            settings,
            state: PacerState::Idle,
        }
    }

    fn enter(&mut self, state: PacerState) {
        log::debug!("virtual time pacer: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn advance(&self, renderer: &mut dyn Renderer, client: &CaptureClient, frame_index: u64, budget_ms: u64) {
        let devtools = client.devtools();
        devtools.reset_budget_expired();

        let params = SetVirtualTimePolicy::advance(budget_ms).to_params();
        let Some(id) = renderer.execute_devtools_method(SET_VIRTUAL_TIME_POLICY, params) else {
            log::warn!("no render surface, cannot advance virtual time for frame {}", frame_index);
            return;
        };

        match devtools.wait_for_result(renderer, id, self.settings.step_ack) {
            Some(true) => {
                if self.settings.await_budget_expiry
                    && !devtools.wait_for_budget_expired(renderer, self.settings.step_ack)
                {
                    log::warn!("virtual time budget for frame {} did not expire in time", frame_index);
                }
            }
            Some(false) => log::warn!("renderer rejected virtual time advance for frame {}", frame_index),
            None => log::warn!(
                "virtual time advance for frame {} not acknowledged within {} ms",
                frame_index,
                self.settings.step_ack.as_millis()
            ),
        }
    }
}

impl Pacer for VirtualTimePacer {
    fn run(&mut self, renderer: &mut dyn Renderer, client: &CaptureClient) -> PaceOutcome {
        let bridge = client.bridge();
        let target = self.settings.target_frames;
        let mut budget = StepBudget::new(self.settings.fps);
        let mut steps = 0u64;
        let mut stalls = 0u64;
        let mut stalled = false;

        self.enter(PacerState::Stepping);
        loop {
            // a stalled frame is retried under the same index
            let frame_index = bridge.accepted_frames();
            if frame_index >= target {
                break;
            }

            let step_ms = budget.next(frame_index);
            steps += 1;
            self.advance(renderer, client, frame_index, step_ms);

            renderer.invalidate();
            renderer.request_external_frame_tick();

            if pump_until(renderer, self.settings.step_frame, || {
                bridge.accepted_frames() > frame_index
            }) {
                log::trace!("frame {} after {} ms of virtual time", frame_index, budget.accumulated_ms());
                stalls = 0;
            } else {
                stalls += 1;
                log::warn!("frame {} stalled ({} in a row)", frame_index, stalls);
                if stalls >= self.settings.stall_limit {
                    log::warn!(
                        "giving up after {} consecutive stalls at frame {}/{}",
                        stalls,
                        frame_index,
                        target
                    );
                    stalled = true;
                    break;
                }
            }
        }

        self.enter(PacerState::Draining);
        drain(renderer, client, &self.settings);
        self.enter(PacerState::Done);

        PaceOutcome {
            state: self.state,
            steps,
            stalled,
        }
    }

    fn state(&self) -> PacerState {
        self.state
    }
}

/// Requests a repaint every wall-clock frame interval and lets the page run in
/// real time.
pub struct IntervalPacer {
    settings: PacerSettings,
    state: PacerState,
}

impl IntervalPacer {
    pub fn new(settings: PacerSettings) -> Self {
        Self {
            settings,
            state: PacerState::Idle,
        }
    }

    fn enter(&mut self, state: PacerState) {
        log::debug!("interval pacer: {:?} -> {:?}", self.state, state);
        self.state = state;
    }
}

impl Pacer for IntervalPacer {
    fn run(&mut self, renderer: &mut dyn Renderer, client: &CaptureClient) -> PaceOutcome {
        let bridge = client.bridge();
        let target = self.settings.target_frames;
        let interval = Duration::from_secs_f64(1.0 / self.settings.fps.max(1) as f64);
        let stall_window = self
            .settings
            .step_frame
            .saturating_mul(u32::try_from(self.settings.stall_limit).unwrap_or(u32::MAX));

        let mut steps = 0u64;
        let mut stalled = false;
        let mut last_count = bridge.accepted_frames();
        let mut last_progress = Instant::now();
        let mut next_request = Instant::now();

        self.enter(PacerState::Stepping);
        loop {
            let accepted = bridge.accepted_frames();
            if accepted >= target {
                break;
            }
            if accepted != last_count {
                last_count = accepted;
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= stall_window {
                log::warn!(
                    "no frame for {} ms, giving up at {}/{}",
                    stall_window.as_millis(),
                    accepted,
                    target
                );
                stalled = true;
                break;
            }

            let now = Instant::now();
            if now >= next_request {
                renderer.invalidate();
                renderer.request_external_frame_tick();
                steps += 1;
                next_request += interval;
                if next_request < now {
                    // fell behind; don't burst to catch up
                    next_request = now + interval;
                }
            }

            let wait = next_request.saturating_duration_since(Instant::now());
            pump_until(renderer, wait, || bridge.accepted_frames() >= target);
        }

        self.enter(PacerState::Draining);
        drain(renderer, client, &self.settings);
        self.enter(PacerState::Done);

        PaceOutcome {
            state: self.state,
            steps,
            stalled,
        }
    }

    fn state(&self) -> PacerState {
        self.state
    }
}
