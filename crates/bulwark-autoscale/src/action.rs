use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bulwark_core::Context;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ScaleUp,
    ScaleDown,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScaleUp => "scale_up",
            Self::ScaleDown => "scale_down",
        }
    }

    pub fn is_up(self) -> bool {
        self == Self::ScaleUp
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replica change the scaler wants applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingAction {
    #[serde(rename = "type")]
    pub action: ActionType,
    pub from_replicas: u32,
    pub target_replicas: u32,
    pub reason: String,
    /// Inputs at decision time: cpu, memory and custom metrics.
    pub metrics: BTreeMap<String, f64>,
    /// The forecast, not the current readings, set the target.
    pub predictive: bool,
    pub timestamp_unix: u64,
}

/// One applied (or failed) action in the scaler's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    pub timestamp_unix: u64,
    #[serde(rename = "type")]
    pub action: ActionType,
    pub from_replicas: u32,
    pub to_replicas: u32,
    pub reason: String,
    pub metrics: BTreeMap<String, f64>,
    pub predictive: bool,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Applies scaling actions to real infrastructure.
///
/// Must be idempotent on `target_replicas`.
#[async_trait]
pub trait ScalingExecutor: Send + Sync {
    async fn apply(&self, ctx: &Context, action: &ScalingAction) -> anyhow::Result<()>;
}

/// Executor that only records the decision in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExecutor;

#[async_trait]
impl ScalingExecutor for LoggingExecutor {
    async fn apply(&self, _ctx: &Context, action: &ScalingAction) -> anyhow::Result<()> {
        info!(
            action = %action.action,
            from = action.from_replicas,
            to = action.target_replicas,
            predictive = action.predictive,
            reason = %action.reason,
            "scaling action (log only)"
        );
        Ok(())
    }
}

/// Bounded FIFO of pending actions. A push into a full queue evicts the
/// oldest entry.
#[derive(Debug)]
pub(crate) struct ActionQueue {
    capacity: usize,
    pending: Mutex<VecDeque<ScalingAction>>,
    ready: Notify,
}

impl ActionQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
        }
    }

    /// Returns the evicted action, if any.
    pub(crate) fn push(&self, action: ScalingAction) -> Option<ScalingAction> {
        let evicted = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if pending.len() >= self.capacity {
                pending.pop_front()
            } else {
                None
            };
            pending.push_back(action);
            evicted
        };
        self.ready.notify_one();
        evicted
    }

    pub(crate) fn pop(&self) -> Option<ScalingAction> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) async fn ready(&self) {
        self.ready.notified().await;
    }
}
