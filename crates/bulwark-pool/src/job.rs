use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulwark_core::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work. Higher `priority` runs first; equal priorities run FIFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, with = "bulwark_core::duration::human_opt")]
    pub timeout: Option<Duration>,
    /// Attempts already made beyond the first.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_retry: u32,
}

impl Job {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload: Value::Null,
            priority: 0,
            timeout: None,
            retries: 0,
            max_retry: 0,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A zero timeout means unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }
}

/// Terminal outcome of a job, emitted once per accepted job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    /// Duration of the final attempt.
    pub duration: Duration,
    pub worker_id: u64,
    pub attempts: u32,
}

/// Executes jobs on behalf of the pool.
///
/// The context is cancelled when the job's timeout elapses or the pool is
/// torn down past its grace period.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: Context, job: Job) -> anyhow::Result<Value>;
}

struct FnJobHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnJobHandler<F>
where
    F: Fn(Context, Job) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: Context, job: Job) -> anyhow::Result<Value> {
        (self.0)(ctx, job).await
    }
}

/// Lift an async closure into a shareable [`JobHandler`].
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Context, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnJobHandler(f))
}
