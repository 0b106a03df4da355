//! Dynamic worker pool.
//!
//! Workers are tasks keyed by id in a map the pool owns. Each worker holds
//! only its own [`WorkerSlot`], a handle to the shared queue and a clone of
//! the result sender; there is no worker → pool back-reference.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bulwark_core::{
    format_duration, join_outcome, ComponentMetrics, Context, Observable, SharedClock, TaskFailure,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::job::{Job, JobHandler, JobResult};
use crate::queue::{JobQueue, PushError};
use crate::worker::{WorkerSlot, WorkerState, WorkerStats};

/// Weight of the newest sample in the throughput average.
const EWMA_ALPHA: f64 = 0.5;

/// Shortest stop grace, so idle workers get a chance to exit on their own.
const MIN_STOP_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    loops: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Counters {
    total_jobs: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    panicked: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Default)]
struct Throughput {
    last_processed: u64,
    last_at: Option<Instant>,
    per_sec: f64,
    primed: bool,
}

#[derive(Debug, Default)]
struct DurationMean {
    count: u64,
    mean_ms: f64,
}

/// Point-in-time pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolMetrics {
    pub name: String,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub retried_jobs: u64,
    pub panicked_jobs: u64,
    pub discarded_jobs: u64,
    pub avg_job_duration_ms: f64,
    pub throughput_per_sec: f64,
}

pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: PoolConfig,
    clock: SharedClock,
    origin: Instant,
    handler: Arc<dyn JobHandler>,
    queue: JobQueue,
    workers: RwLock<HashMap<u64, Arc<WorkerSlot>>>,
    /// Tasks of scaled-down workers, joined at stop.
    retired: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    /// Stops the loops and every waiting worker.
    shutdown: CancellationToken,
    /// Cancels in-flight jobs once the stop grace period runs out.
    hard_stop: CancellationToken,
    results_tx: Mutex<Option<mpsc::Sender<JobResult>>>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    /// Nanoseconds since `origin`.
    last_scale: AtomicU64,
    counters: Counters,
    durations: Mutex<DurationMean>,
    throughput: Mutex<Throughput>,
}

impl WorkerPool {
    pub fn new(
        name: impl Into<String>,
        config: PoolConfig,
        handler: Arc<dyn JobHandler>,
        clock: SharedClock,
    ) -> PoolResult<Self> {
        config.validate()?;
        let (results_tx, results_rx) = mpsc::channel(config.queue_size);
        let origin = clock.now();
        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                queue: JobQueue::new(config.queue_size),
                config,
                clock,
                origin,
                handler,
                workers: RwLock::new(HashMap::new()),
                retired: Mutex::new(Vec::new()),
                next_worker_id: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle {
                    phase: Phase::Created,
                    loops: Vec::new(),
                }),
                shutdown: CancellationToken::new(),
                hard_stop: CancellationToken::new(),
                results_tx: Mutex::new(Some(results_tx)),
                results_rx: Mutex::new(Some(results_rx)),
                last_scale: AtomicU64::new(0),
                counters: Counters::default(),
                durations: Mutex::new(DurationMean::default()),
                throughput: Mutex::new(Throughput::default()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Spawn `min_workers` workers plus the scaling and metrics loops.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) -> PoolResult<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        match lifecycle.phase {
            Phase::Created => {}
            Phase::Running => return Err(PoolError::AlreadyRunning(inner.name.clone())),
            Phase::Stopping | Phase::Stopped => return Err(PoolError::Stopped(inner.name.clone())),
        }

        info!(
            pool = %inner.name,
            min_workers = inner.config.min_workers,
            max_workers = inner.config.max_workers,
            queue_size = inner.config.queue_size,
            "starting worker pool"
        );

        inner.last_scale.store(inner.now_nanos(), Ordering::Release);
        inner
            .throughput
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_at = Some(inner.clock.now());

        for _ in 0..inner.config.min_workers {
            inner.add_worker();
        }
        lifecycle
            .loops
            .push(tokio::spawn(Arc::clone(inner).run_scaling()));
        lifecycle
            .loops
            .push(tokio::spawn(Arc::clone(inner).run_metrics()));
        lifecycle.phase = Phase::Running;

        info!(pool = %inner.name, workers = inner.worker_count(), "worker pool started");
        Ok(())
    }

    /// Enqueue without blocking.
    pub fn submit(&self, ctx: &Context, job: Job) -> PoolResult<()> {
        let inner = &self.inner;
        if ctx.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        match inner.phase() {
            Phase::Running => {}
            Phase::Created => return Err(PoolError::NotRunning(inner.name.clone())),
            Phase::Stopping | Phase::Stopped => return Err(PoolError::Stopped(inner.name.clone())),
        }

        match inner.queue.push(job) {
            Ok(depth) => {
                inner.counters.total_jobs.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %inner.name, queue_depth = depth, "job submitted");
                Ok(())
            }
            Err(PushError::Full(job)) => {
                debug!(pool = %inner.name, job_id = %job.id, "job queue full");
                Err(PoolError::QueueFull {
                    pool: inner.name.clone(),
                    capacity: inner.queue.capacity(),
                })
            }
            Err(PushError::Closed(_)) => Err(PoolError::Stopped(inner.name.clone())),
        }
    }

    /// Hand out the result receiver; only the first call gets it.
    ///
    /// The channel holds up to `queue_size` results. Workers wait for room,
    /// so a pool whose results are never drained eventually stalls.
    pub fn take_results(&self) -> Option<mpsc::Receiver<JobResult>> {
        self.inner
            .results_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count()
    }

    pub fn busy_workers(&self) -> usize {
        self.inner.count_in(WorkerState::Busy)
    }

    pub fn idle_workers(&self) -> usize {
        self.inner.count_in(WorkerState::Idle)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        let now = self.inner.now_nanos();
        let mut stats: Vec<WorkerStats> = self
            .inner
            .snapshot_workers()
            .iter()
            .map(|w| w.stats(now))
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    pub fn metrics(&self) -> PoolMetrics {
        let inner = &self.inner;
        let workers = inner.snapshot_workers();
        let busy = workers
            .iter()
            .filter(|w| w.state() == WorkerState::Busy)
            .count();
        let idle = workers
            .iter()
            .filter(|w| w.state() == WorkerState::Idle)
            .count();
        let c = &inner.counters;

        PoolMetrics {
            name: inner.name.clone(),
            active_workers: workers.len(),
            busy_workers: busy,
            idle_workers: idle,
            queue_depth: inner.queue.len(),
            queue_capacity: inner.queue.capacity(),
            total_jobs: c.total_jobs.load(Ordering::Relaxed),
            completed_jobs: c.completed.load(Ordering::Relaxed),
            failed_jobs: c.failed.load(Ordering::Relaxed),
            retried_jobs: c.retried.load(Ordering::Relaxed),
            panicked_jobs: c.panicked.load(Ordering::Relaxed),
            discarded_jobs: c.discarded.load(Ordering::Relaxed),
            avg_job_duration_ms: inner
                .durations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .mean_ms,
            throughput_per_sec: inner
                .throughput
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .per_sec,
        }
    }

    /// Drain and stop.
    ///
    /// Pending jobs are discarded. In-flight jobs get a grace period equal to
    /// the longest outstanding job timeout (`worker_timeout` for unbounded
    /// jobs); whatever is still running afterwards is cancelled. The result
    /// channel closes once every worker has returned.
    pub async fn stop(&self) -> PoolResult<()> {
        let inner = &self.inner;
        let loops = {
            let mut lifecycle = inner.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
            match lifecycle.phase {
                Phase::Running => {}
                Phase::Created => {
                    lifecycle.phase = Phase::Stopped;
                    inner.queue.close();
                    inner.close_results();
                    return Ok(());
                }
                Phase::Stopping | Phase::Stopped => return Ok(()),
            }
            lifecycle.phase = Phase::Stopping;
            std::mem::take(&mut lifecycle.loops)
        };

        info!(pool = %inner.name, "stopping worker pool");
        let discarded = inner.queue.close();
        if !discarded.is_empty() {
            inner
                .counters
                .discarded
                .fetch_add(discarded.len() as u64, Ordering::Relaxed);
            warn!(pool = %inner.name, discarded = discarded.len(), "discarding pending jobs");
        }
        inner.shutdown.cancel();

        let workers: Vec<Arc<WorkerSlot>> = inner
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let grace = workers
            .iter()
            .filter(|w| w.state() == WorkerState::Busy)
            .map(|w| w.current_timeout().unwrap_or(inner.config.worker_timeout))
            .max()
            .unwrap_or_default()
            .max(MIN_STOP_GRACE);

        let mut handles: Vec<JoinHandle<()>> = workers.iter().filter_map(|w| w.take_task()).collect();
        handles.extend(
            inner
                .retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..),
        );
        for worker in &workers {
            worker.quit.cancel();
        }

        let drained = tokio::select! {
            _ = async {
                for handle in handles.iter_mut() {
                    let _ = handle.await;
                }
            } => true,
            _ = inner.clock.sleep(grace) => false,
        };
        if !drained {
            // Joined handles must not be polled again.
            let stragglers: Vec<JoinHandle<()>> = handles.into_iter().filter(|h| !h.is_finished()).collect();
            warn!(
                pool = %inner.name,
                still_running = stragglers.len(),
                grace = %format_duration(grace),
                "grace period expired, cancelling in-flight jobs"
            );
            inner.hard_stop.cancel();
            for handle in &stragglers {
                handle.abort();
            }
            for handle in stragglers {
                let _ = handle.await;
            }
        }

        for handle in loops {
            let _ = handle.await;
        }
        inner.close_results();
        inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase = Phase::Stopped;

        info!(
            pool = %inner.name,
            completed = inner.counters.completed.load(Ordering::Relaxed),
            failed = inner.counters.failed.load(Ordering::Relaxed),
            "worker pool stopped"
        );
        Ok(())
    }
}

impl Inner {
    fn phase(&self) -> Phase {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .phase
    }

    fn now_nanos(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    fn snapshot_workers(&self) -> Vec<Arc<WorkerSlot>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn worker_count(&self) -> usize {
        self.workers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn count_in(&self, state: WorkerState) -> usize {
        self.snapshot_workers()
            .iter()
            .filter(|w| w.state() == state)
            .count()
    }

    fn close_results(&self) {
        self.results_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn add_worker(self: &Arc<Self>) -> Option<u64> {
        let results = self
            .results_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::new(WorkerSlot::new(id, self.now_nanos()));

        let total = {
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            workers.insert(id, Arc::clone(&slot));
            workers.len()
        };
        let handle = tokio::spawn(Arc::clone(self).run_worker(Arc::clone(&slot), results));
        slot.attach(handle);

        debug!(pool = %self.name, worker_id = id, total_workers = total, "added worker");
        Some(id)
    }

    /// Drain the worker idle the longest, if it has been idle past the
    /// scale-down cooldown.
    fn retire_idle_worker(&self) -> Option<u64> {
        let now = self.now_nanos();
        let cooldown = self.config.scale_down_cooldown;

        let retired = {
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            let candidate = workers
                .values()
                .filter(|w| w.state() == WorkerState::Idle && w.idle_for(now) > cooldown)
                .max_by_key(|w| w.idle_for(now))
                .cloned()?;
            if !candidate.drain() {
                return None;
            }
            workers.remove(&candidate.id);
            candidate
        };

        if let Some(handle) = retired.take_task() {
            let mut tasks = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.retain(|h| !h.is_finished());
            tasks.push(handle);
        }
        debug!(pool = %self.name, worker_id = retired.id, "retired idle worker");
        Some(retired.id)
    }

    fn evaluate_scaling(self: &Arc<Self>) {
        let depth = self.queue.len();
        let utilization = depth as f64 / self.queue.capacity() as f64;
        let workers = self.worker_count();
        let now = self.now_nanos();
        let since_last = Duration::from_nanos(now.saturating_sub(self.last_scale.load(Ordering::Acquire)));
        let config = &self.config;

        if utilization > config.scale_up_threshold
            && workers < config.max_workers
            && since_last >= config.scale_up_cooldown
        {
            if self.add_worker().is_some() {
                self.last_scale.store(now, Ordering::Release);
                info!(
                    pool = %self.name,
                    queue_utilization = utilization,
                    workers = self.worker_count(),
                    "scaled up worker pool"
                );
            }
        } else if utilization < config.scale_down_threshold
            && workers > config.min_workers
            && since_last >= config.scale_down_cooldown
        {
            if let Some(worker_id) = self.retire_idle_worker() {
                self.last_scale.store(now, Ordering::Release);
                info!(
                    pool = %self.name,
                    worker_id,
                    queue_utilization = utilization,
                    workers = self.worker_count(),
                    "scaled down worker pool"
                );
            }
        }
    }

    async fn run_scaling(self: Arc<Self>) {
        let mut ticker = self.clock.ticker(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate_scaling(),
                _ = self.shutdown.cancelled() => {
                    debug!(pool = %self.name, "scaling loop shutting down");
                    break;
                }
            }
        }
    }

    async fn run_metrics(self: Arc<Self>) {
        let mut ticker = self.clock.ticker(self.config.metrics_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sample_throughput(),
                _ = self.shutdown.cancelled() => {
                    debug!(pool = %self.name, "metrics loop shutting down");
                    break;
                }
            }
        }
    }

    fn sample_throughput(&self) {
        let now = self.clock.now();
        let processed =
            self.counters.completed.load(Ordering::Relaxed) + self.counters.failed.load(Ordering::Relaxed);

        let per_sec = {
            let mut t = self.throughput.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(last_at) = t.last_at {
                let secs = now.saturating_duration_since(last_at).as_secs_f64();
                if secs > 0.0 {
                    let sample = processed.saturating_sub(t.last_processed) as f64 / secs;
                    t.per_sec = if t.primed {
                        EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * t.per_sec
                    } else {
                        sample
                    };
                    t.primed = true;
                }
            }
            t.last_processed = processed;
            t.last_at = Some(now);
            t.per_sec
        };

        debug!(
            pool = %self.name,
            workers = self.worker_count(),
            queue_depth = self.queue.len(),
            throughput_per_sec = per_sec,
            "pool metrics"
        );
    }

    fn observe_duration(&self, duration: Duration) {
        let mut d = self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        d.count += 1;
        let ms = duration.as_secs_f64() * 1000.0;
        d.mean_ms += (ms - d.mean_ms) / d.count as f64;
    }

    async fn run_worker(self: Arc<Self>, slot: Arc<WorkerSlot>, results: mpsc::Sender<JobResult>) {
        debug!(pool = %self.name, worker_id = slot.id, "worker started");
        loop {
            if slot.quit.is_cancelled() || self.shutdown.is_cancelled() || !slot.claim() {
                break;
            }
            if let Some(job) = self.queue.pop() {
                let result = self.execute(&slot, job).await;
                slot.release(self.now_nanos());
                if let Some(result) = result {
                    self.deliver(&results, result).await;
                }
                continue;
            }
            slot.unclaim();

            tokio::select! {
                _ = slot.quit.cancelled() => break,
                _ = self.shutdown.cancelled() => break,
                _ = self.queue.ready() => {}
            }
        }

        slot.mark_draining();
        if !self.queue.is_empty() {
            self.queue.wake_one();
        }
        debug!(pool = %self.name, worker_id = slot.id, "worker stopped");
    }

    /// Run one attempt. Returns `None` when the job went back on the queue
    /// for a retry.
    async fn execute(&self, slot: &WorkerSlot, mut job: Job) -> Option<JobResult> {
        let started = self.clock.now();
        let timeout = job.timeout;
        slot.begin_job(self.now_nanos(), timeout);

        let base = Context::from_token(self.hard_stop.child_token());
        let ctx = match timeout {
            Some(limit) => base.with_timeout(self.clock.as_ref(), limit),
            None => base,
        };
        let handler = Arc::clone(&self.handler);
        let task_ctx = ctx.clone();
        let task_job = job.clone();
        let mut task = tokio::spawn(async move { handler.handle(task_ctx, task_job).await });

        let deadline = async {
            match timeout {
                Some(limit) => self.clock.sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome: Result<Value, String> = tokio::select! {
            joined = &mut task => match join_outcome(joined) {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(TaskFailure::Panicked(msg)) => {
                    self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(pool = %self.name, worker_id = slot.id, job_id = %job.id, panic = %msg, "job panicked");
                    Err(format!("job panicked: {msg}"))
                }
                Err(TaskFailure::Cancelled) => Err("job cancelled".to_string()),
            },
            _ = deadline => {
                ctx.cancel();
                task.abort();
                Err(format!("job timed out after {}", format_duration(timeout.unwrap_or_default())))
            }
            _ = self.hard_stop.cancelled() => {
                task.abort();
                Err("pool stopped before the job finished".to_string())
            }
        };

        let duration = self.clock.now().saturating_duration_since(started);
        slot.record(duration, outcome.is_err());
        let attempts = job.retries + 1;

        let error = match outcome {
            Ok(output) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.observe_duration(duration);
                return Some(JobResult {
                    job_id: job.id,
                    success: true,
                    output: Some(output),
                    error: None,
                    duration,
                    worker_id: slot.id,
                    attempts,
                });
            }
            Err(error) => error,
        };

        if job.retries < job.max_retry && !self.hard_stop.is_cancelled() {
            job.retries += 1;
            let job_id = job.id.clone();
            match self.queue.push(job) {
                Ok(_) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.name, job_id = %job_id, attempt = attempts, error = %error, "job failed, retrying");
                    return None;
                }
                Err(PushError::Full(back) | PushError::Closed(back)) => {
                    warn!(pool = %self.name, job_id = %job_id, "could not requeue job for retry");
                    job = back;
                }
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.observe_duration(duration);
        debug!(pool = %self.name, worker_id = slot.id, job_id = %job.id, attempts, error = %error, "job failed");
        Some(JobResult {
            job_id: job.id,
            success: false,
            output: None,
            error: Some(error),
            duration,
            worker_id: slot.id,
            attempts,
        })
    }

    async fn deliver(&self, results: &mpsc::Sender<JobResult>, result: JobResult) {
        tokio::select! {
            sent = results.send(result) => {
                if sent.is_err() {
                    debug!(pool = %self.name, "result receiver dropped");
                }
            }
            _ = self.hard_stop.cancelled() => {
                warn!(pool = %self.name, "dropping job result, pool stopped");
            }
        }
    }
}

impl Observable for WorkerPool {
    fn observe(&self) -> Vec<ComponentMetrics> {
        let m = self.metrics();
        let captured_at = self.inner.clock.unix_time().as_secs();
        vec![
            ComponentMetrics::new("worker_pool", &m.name, captured_at)
                .gauge("active_workers", m.active_workers as f64)
                .gauge("busy_workers", m.busy_workers as f64)
                .gauge("idle_workers", m.idle_workers as f64)
                .gauge("queue_depth", m.queue_depth as f64)
                .gauge("queue_utilization", m.queue_depth as f64 / m.queue_capacity as f64)
                .gauge("total_jobs", m.total_jobs as f64)
                .gauge("completed_jobs", m.completed_jobs as f64)
                .gauge("failed_jobs", m.failed_jobs as f64)
                .gauge("avg_job_duration_ms", m.avg_job_duration_ms)
                .gauge("throughput_per_sec", m.throughput_per_sec),
        ]
    }
}
