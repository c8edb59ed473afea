//! DevTools request/result correlation.
//!
//! Requests are fire-and-forget on the renderer side: we get an id back
//! immediately and the success flag arrives later through
//! [`RenderClient::on_devtools_result`](crate::renderer::RenderClient::on_devtools_result).
//! [`DevToolsTable`] is the rendezvous point: the renderer inserts a result
//! once, the waiter removes it on read. Looking up an id that has not arrived
//! yet is a miss, not an error.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::renderer::{pump_until, Renderer};

/// Caller-visible DevTools message id
pub type MessageId = i32;

pub const PAGE_ENABLE: &str = "Page.enable";
pub const SET_VIRTUAL_TIME_POLICY: &str = "Emulation.setVirtualTimePolicy";
pub const VIRTUAL_TIME_BUDGET_EXPIRED: &str = "Emulation.virtualTimeBudgetExpired";

/// Starvation count sent with every virtual-time request
pub const MAX_TASK_STARVATION: u32 = 500;

/// `Emulation.VirtualTimePolicy`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VirtualTimePolicy {
    Pause,
    PauseIfNetworkFetchesPending,
    Advance,
}

/// Parameters of `Emulation.setVirtualTimePolicy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVirtualTimePolicy {
    pub policy: VirtualTimePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_virtual_time_task_starvation_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_virtual_time: Option<f64>,
}

impl SetVirtualTimePolicy {
    /// Freeze the page clock at zero until we start stepping it.
    pub fn paused_at_start() -> Self {
        Self {
            policy: VirtualTimePolicy::PauseIfNetworkFetchesPending,
            budget: Some(0.0),
            max_virtual_time_task_starvation_count: Some(MAX_TASK_STARVATION),
            initial_virtual_time: Some(0.0),
        }
    }

    /// Let the page clock run for `budget_ms`, then pause again.
    pub fn advance(budget_ms: u64) -> Self {
        Self {
            policy: VirtualTimePolicy::Advance,
            budget: Some(budget_ms as f64),
            max_virtual_time_task_starvation_count: Some(MAX_TASK_STARVATION),
            initial_virtual_time: None,
        }
    }

    pub fn to_params(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Rendezvous table for DevTools results plus the budget-expired flag
#[derive(Debug, Default)]
pub struct DevToolsTable {
    results: Mutex<HashMap<MessageId, bool>>,
    budget_expired: AtomicBool,
}

impl DevToolsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result for `id`. Called by the renderer, once per id.
    pub fn complete(&self, id: MessageId, success: bool) {
        if self.results.lock().insert(id, success).is_some() {
            log::warn!("devtools result {} delivered twice", id);
        }
    }

    /// Remove and return the result for `id`, if it has arrived.
    pub fn take(&self, id: MessageId) -> Option<bool> {
        self.results.lock().remove(&id)
    }

    /// Results delivered but not yet read
    pub fn unread(&self) -> usize {
        self.results.lock().len()
    }

    /// Feed a protocol event.
    pub fn on_event(&self, method: &str) {
        if method == VIRTUAL_TIME_BUDGET_EXPIRED {
            self.budget_expired.store(true, Ordering::Release);
        }
    }

    pub fn budget_expired(&self) -> bool {
        self.budget_expired.load(Ordering::Acquire)
    }

    pub fn reset_budget_expired(&self) {
        self.budget_expired.store(false, Ordering::Release);
    }

    /// Pump `renderer` until the result for `id` arrives or `timeout` passes.
    ///
    /// `Some(success)` when a result was read, `None` on timeout.
    pub fn wait_for_result(
        &self,
        renderer: &mut dyn Renderer,
        id: MessageId,
        timeout: Duration,
    ) -> Option<bool> {
        let mut result = None;
        pump_until(renderer, timeout, || {
            result = self.take(id);
            result.is_some()
        });
        result
    }

    /// Pump `renderer` until the budget-expired event fires or `timeout` passes.
    pub fn wait_for_budget_expired(&self, renderer: &mut dyn Renderer, timeout: Duration) -> bool {
        pump_until(renderer, timeout, || self.budget_expired())
    }
}
