use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bulwark_core::{join_outcome, ComponentMetrics, Context, Observable, SharedClock, TaskFailure};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BreakerConfig;
use crate::error::{BreakerError, BreakerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum BreakerState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl BreakerState {
    fn from_u32(raw: u32) -> Self {
        match raw {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type FallbackFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

type Fallback<T> = Arc<dyn Fn(Context, BreakerError) -> FallbackFuture<T> + Send + Sync>;

#[derive(Debug, Default)]
struct Stats {
    requests: AtomicU64,
    failures: AtomicU64,
    successes: AtomicU64,
    timeouts: AtomicU64,
    rejected: AtomicU64,
    consecutive_failures: AtomicU64,
    half_open_requests: AtomicU64,
    half_open_successes: AtomicU64,
    half_open_in_flight: AtomicU64,
    times_opened: AtomicU64,
}

/// Snapshot returned by [`CircuitBreaker::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: BreakerState,
    pub requests: u64,
    pub failures: u64,
    pub successes: u64,
    pub timeouts: u64,
    pub rejected: u64,
    pub consecutive_failures: u64,
    pub times_opened: u64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub time_in_state_ms: u64,
    pub half_open_requests: u64,
    pub half_open_successes: u64,
    pub half_open_in_flight: u64,
}

impl BreakerMetrics {
    pub fn to_component(&self, captured_at_unix: u64) -> ComponentMetrics {
        ComponentMetrics::new("circuit_breaker", &self.name, captured_at_unix)
            .gauge("state", self.state as u32 as f64)
            .gauge("requests", self.requests as f64)
            .gauge("failures", self.failures as f64)
            .gauge("successes", self.successes as f64)
            .gauge("timeouts", self.timeouts as f64)
            .gauge("rejected", self.rejected as f64)
            .gauge("times_opened", self.times_opened as f64)
            .gauge("failure_rate", self.failure_rate)
            .gauge("half_open_in_flight", self.half_open_in_flight as f64)
    }
}

enum Outcome<T> {
    Success(T),
    Failure(anyhow::Error),
    Timeout(Duration),
    Panicked(String),
    Cancelled,
}

/// Admission ticket. Probes remember the half-open generation they were
/// admitted under so late results from an earlier probe round are ignored.
struct Permit {
    probe_generation: Option<u64>,
}

pub struct CircuitBreaker<T> {
    name: String,
    config: BreakerConfig,
    clock: SharedClock,
    origin: Instant,
    state: AtomicU32,
    /// Nanoseconds since `origin`.
    state_changed_at: AtomicU64,
    /// Nanoseconds since `origin` at the last counter decay.
    window_started_at: AtomicU64,
    generation: AtomicU64,
    stats: Stats,
    fallback: RwLock<Option<Fallback<T>>>,
}

impl<T: Send + 'static> CircuitBreaker<T> {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: SharedClock) -> BreakerResult<Self> {
        config.validate()?;
        let origin = clock.now();
        Ok(Self {
            name: name.into(),
            config,
            clock,
            origin,
            state: AtomicU32::new(BreakerState::Closed as u32),
            state_changed_at: AtomicU64::new(0),
            window_started_at: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            stats: Stats::default(),
            fallback: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Register the alternative path used when the breaker rejects a call or
    /// the call times out.
    pub fn set_fallback<F, Fut>(&self, fallback: F)
    where
        F: Fn(Context, BreakerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let boxed: Fallback<T> = Arc::new(move |ctx, err| Box::pin(fallback(ctx, err)));
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = Some(boxed);
    }

    pub fn clear_fallback(&self) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` through the breaker.
    ///
    /// `f` receives a child of `ctx` that is cancelled on timeout. When the
    /// breaker rejects the call, `f` is never invoked.
    pub async fn execute<F, Fut>(&self, ctx: &Context, f: F) -> BreakerResult<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if ctx.is_cancelled() {
            return Err(BreakerError::Cancelled);
        }

        let permit = match self.admit() {
            Ok(permit) => permit,
            Err(rejection) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, reason = %rejection, "call rejected");
                return self.fallback_or(ctx, rejection).await;
            }
        };

        let outcome = self.run(ctx, f).await;
        self.record(&permit, &outcome);

        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(BreakerError::Inner(err)),
            Outcome::Timeout(after) => self.fallback_or(ctx, BreakerError::Timeout(after)).await,
            Outcome::Panicked(msg) => Err(BreakerError::Panicked(msg)),
            Outcome::Cancelled => Err(BreakerError::Cancelled),
        }
    }

    fn admit(&self) -> Result<Permit, BreakerError> {
        loop {
            match self.state() {
                BreakerState::Closed => return Ok(Permit { probe_generation: None }),
                BreakerState::Open => {
                    if self.time_in_state() < self.config.open_timeout {
                        return Err(BreakerError::Open);
                    }
                    // Losing the race is fine: re-read and follow the winner.
                    self.transition(BreakerState::Open, BreakerState::HalfOpen);
                }
                BreakerState::HalfOpen => {
                    let generation = self.generation.load(Ordering::Acquire);
                    let max = self.config.half_open_max_requests;
                    let acquired = self
                        .stats
                        .half_open_in_flight
                        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
                        .is_ok();
                    return if acquired {
                        Ok(Permit {
                            probe_generation: Some(generation),
                        })
                    } else {
                        Err(BreakerError::HalfOpenLimitExceeded)
                    };
                }
            }
        }
    }

    async fn run<F, Fut>(&self, ctx: &Context, f: F) -> Outcome<T>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let limit = match ctx.remaining(self.clock.now()) {
            Some(left) => left.min(self.config.timeout_threshold),
            None => self.config.timeout_threshold,
        };
        let call_ctx = ctx.child();
        let task_ctx = call_ctx.clone();
        let mut handle = tokio::spawn(async move { f(task_ctx).await });

        tokio::select! {
            joined = &mut handle => match join_outcome(joined) {
                Ok(Ok(value)) => Outcome::Success(value),
                Ok(Err(err)) => Outcome::Failure(err),
                Err(TaskFailure::Panicked(msg)) => {
                    error!(breaker = %self.name, panic = %msg, "protected call panicked");
                    Outcome::Panicked(msg)
                }
                Err(TaskFailure::Cancelled) => Outcome::Cancelled,
            },
            _ = self.clock.sleep(limit) => {
                call_ctx.cancel();
                handle.abort();
                debug!(breaker = %self.name, timeout_ms = limit.as_millis() as u64, "protected call timed out");
                Outcome::Timeout(limit)
            }
            _ = ctx.cancelled() => {
                call_ctx.cancel();
                handle.abort();
                Outcome::Cancelled
            }
        }
    }

    async fn fallback_or(&self, ctx: &Context, err: BreakerError) -> BreakerResult<T> {
        let fallback = self
            .fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(fallback) = fallback else {
            return Err(err);
        };

        debug!(breaker = %self.name, reason = %err, "running fallback");
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move { fallback(ctx, err).await });
        match join_outcome(handle.await) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BreakerError::Inner(err)),
            Err(TaskFailure::Panicked(msg)) => {
                error!(breaker = %self.name, panic = %msg, "fallback panicked");
                Err(BreakerError::Panicked(msg))
            }
            Err(TaskFailure::Cancelled) => Err(BreakerError::Cancelled),
        }
    }

    fn record(&self, permit: &Permit, outcome: &Outcome<T>) {
        match outcome {
            Outcome::Success(_) => self.on_success(permit),
            Outcome::Timeout(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                self.on_failure(permit);
            }
            Outcome::Failure(_) | Outcome::Panicked(_) => self.on_failure(permit),
            Outcome::Cancelled => {}
        }
        self.release(permit);
    }

    fn is_current_probe(&self, permit: &Permit) -> bool {
        permit.probe_generation == Some(self.generation.load(Ordering::Acquire))
    }

    fn on_success(&self, permit: &Permit) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.successes.fetch_add(1, Ordering::Relaxed);
        self.stats.consecutive_failures.store(0, Ordering::Relaxed);

        if !self.is_current_probe(permit) || self.state() != BreakerState::HalfOpen {
            return;
        }
        let successes = self.stats.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
        let probes = self.stats.half_open_requests.fetch_add(1, Ordering::AcqRel) + 1;
        let ratio = successes as f64 / probes as f64;
        // Gated on probe count, not success count.
        if probes >= self.config.success_threshold && ratio >= self.config.half_open_success_ratio {
            self.transition(BreakerState::HalfOpen, BreakerState::Closed);
        }
    }

    fn on_failure(&self, permit: &Permit) {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.stats.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            BreakerState::Closed if consecutive >= self.config.failure_threshold => {
                self.transition(BreakerState::Closed, BreakerState::Open);
            }
            BreakerState::HalfOpen if self.is_current_probe(permit) => {
                self.stats.half_open_requests.fetch_add(1, Ordering::AcqRel);
                self.transition(BreakerState::HalfOpen, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release(&self, permit: &Permit) {
        if self.is_current_probe(permit) {
            let _ = self
                .stats
                .half_open_in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn transition(&self, from: BreakerState, to: BreakerState) -> bool {
        if self
            .state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let now = self.elapsed_nanos();
        self.state_changed_at.store(now, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.clear_half_open();

        match to {
            BreakerState::Closed => {
                self.clear_rolling();
                self.window_started_at.store(now, Ordering::Release);
                info!(breaker = %self.name, from = %from, "circuit breaker closed");
            }
            BreakerState::Open => {
                self.stats.times_opened.fetch_add(1, Ordering::Relaxed);
                warn!(
                    breaker = %self.name,
                    from = %from,
                    failures = self.stats.failures.load(Ordering::Relaxed),
                    consecutive_failures = self.stats.consecutive_failures.load(Ordering::Relaxed),
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                info!(breaker = %self.name, "circuit breaker half-open, probing");
            }
        }
        true
    }

    /// Force the breaker closed and clear every counter.
    pub fn reset(&self) {
        let previous = BreakerState::from_u32(
            self.state
                .swap(BreakerState::Closed as u32, Ordering::AcqRel),
        );
        let now = self.elapsed_nanos();
        self.state_changed_at.store(now, Ordering::Release);
        self.window_started_at.store(now, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.clear_half_open();
        self.clear_rolling();
        info!(breaker = %self.name, from = %previous, "circuit breaker reset");
    }

    /// One monitoring tick: decay closed counters every `reset_timeout` and
    /// reopen a breaker stuck half-open past `half_open_timeout`.
    pub fn maintain(&self) {
        let now = self.elapsed_nanos();
        match self.state() {
            BreakerState::Closed => {
                let since = self
                    .state_changed_at
                    .load(Ordering::Acquire)
                    .max(self.window_started_at.load(Ordering::Acquire));
                if Duration::from_nanos(now.saturating_sub(since)) >= self.config.reset_timeout {
                    self.clear_rolling();
                    self.window_started_at.store(now, Ordering::Release);
                    debug!(breaker = %self.name, "decayed breaker counters");
                }
            }
            BreakerState::HalfOpen => {
                let limit = self.config.half_open_timeout;
                if !limit.is_zero()
                    && self.time_in_state() >= limit
                    && self.transition(BreakerState::HalfOpen, BreakerState::Open)
                {
                    warn!(breaker = %self.name, "half-open window expired, reopening");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Run [`maintain`](Self::maintain) every `monitoring_interval`.
    pub async fn run_monitor(&self, shutdown: CancellationToken) {
        let mut ticker = self.clock.ticker(self.config.monitoring_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintain();
                    let m = self.metrics();
                    debug!(
                        breaker = %self.name,
                        state = %m.state,
                        requests = m.requests,
                        failures = m.failures,
                        failure_rate = m.failure_rate,
                        "circuit breaker metrics"
                    );
                }
                _ = shutdown.cancelled() => {
                    debug!(breaker = %self.name, "breaker monitor shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let breaker = Arc::clone(self);
        tokio::spawn(async move { breaker.run_monitor(shutdown).await })
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let s = &self.stats;
        let requests = s.requests.load(Ordering::Relaxed);
        let failures = s.failures.load(Ordering::Relaxed);
        let successes = s.successes.load(Ordering::Relaxed);
        let timeouts = s.timeouts.load(Ordering::Relaxed);
        let rate = |n: u64| if requests > 0 { n as f64 / requests as f64 } else { 0.0 };

        BreakerMetrics {
            name: self.name.clone(),
            state: self.state(),
            requests,
            failures,
            successes,
            timeouts,
            rejected: s.rejected.load(Ordering::Relaxed),
            consecutive_failures: s.consecutive_failures.load(Ordering::Relaxed),
            times_opened: s.times_opened.load(Ordering::Relaxed),
            failure_rate: rate(failures),
            success_rate: rate(successes),
            timeout_rate: rate(timeouts),
            time_in_state_ms: u64::try_from(self.time_in_state().as_millis()).unwrap_or(u64::MAX),
            half_open_requests: s.half_open_requests.load(Ordering::Relaxed),
            half_open_successes: s.half_open_successes.load(Ordering::Relaxed),
            half_open_in_flight: s.half_open_in_flight.load(Ordering::Relaxed),
        }
    }

    fn clear_rolling(&self) {
        for counter in [
            &self.stats.requests,
            &self.stats.failures,
            &self.stats.successes,
            &self.stats.timeouts,
            &self.stats.rejected,
            &self.stats.consecutive_failures,
        ] {
            counter.store(0, Ordering::Release);
        }
    }

    fn clear_half_open(&self) {
        self.stats.half_open_requests.store(0, Ordering::Release);
        self.stats.half_open_successes.store(0, Ordering::Release);
        self.stats.half_open_in_flight.store(0, Ordering::Release);
    }

    fn elapsed_nanos(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
    }

    fn time_in_state(&self) -> Duration {
        let changed = self.state_changed_at.load(Ordering::Acquire);
        Duration::from_nanos(self.elapsed_nanos().saturating_sub(changed))
    }
}

impl<T: Send + 'static> Observable for CircuitBreaker<T> {
    fn observe(&self) -> Vec<ComponentMetrics> {
        vec![self.metrics().to_component(self.clock.unix_time().as_secs())]
    }
}
