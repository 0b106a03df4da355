//! AutoScaler — reactive plus predictive replica recommendations.
//!
//! Readings arrive through [`AutoScaler::update_metrics`]. Every
//! `evaluation_interval` the evaluator turns the latest readings into a
//! desired replica count and, when it differs from the current one and the
//! direction's cooldown has passed, queues a [`ScalingAction`]. A separate
//! executor task hands queued actions to the injected [`ScalingExecutor`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bulwark_core::{join_outcome, ComponentMetrics, Context, Observable, SharedClock, TaskFailure};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{ActionQueue, ActionType, ScalingAction, ScalingEvent, ScalingExecutor};
use crate::config::AutoScalerConfig;
use crate::error::{ScalerError, ScalerResult};
use crate::predictor::{LoadPrediction, LoadPredictor, LoadSample};

const HISTORY_LIMIT: usize = 100;
const RECENT_EVENTS: usize = 10;

/// How the evaluator arrived at a replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recommendation {
    pub current: u32,
    /// From the latest readings alone.
    pub reactive: u32,
    /// From confident forecasts, when there are any.
    pub predictive: Option<u32>,
    /// Clamped to `[min_replicas, max_replicas]`.
    pub desired: u32,
}

#[derive(Debug, Default)]
struct Readings {
    cpu: f64,
    memory: f64,
    custom: BTreeMap<String, f64>,
    updated_at: Option<Instant>,
}

impl Readings {
    fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.custom.clone();
        metrics.insert("cpu_utilization".to_string(), self.cpu);
        metrics.insert("memory_utilization".to_string(), self.memory);
        metrics
    }
}

struct ScaleState {
    current_replicas: u32,
    desired_replicas: u32,
    /// Last successful application, per direction.
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
    last_scale_unix: Option<u64>,
    scale_up_count: u64,
    scale_down_count: u64,
    failed_actions: u64,
    readings: Readings,
    predictors: Vec<LoadPredictor>,
    predictions: BTreeMap<String, LoadPrediction>,
    history: VecDeque<ScalingEvent>,
}

impl ScaleState {
    fn last_scale(&self, action: ActionType) -> Option<Instant> {
        match action {
            ActionType::ScaleUp => self.last_scale_up,
            ActionType::ScaleDown => self.last_scale_down,
        }
    }
}

/// Snapshot returned by [`AutoScaler::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalerMetrics {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub last_scale_unix: Option<u64>,
    pub scale_up_count: u64,
    pub scale_down_count: u64,
    pub failed_actions: u64,
    pub dropped_actions: u64,
    pub pending_actions: usize,
    pub cpu_utilization: f64,
    pub memory_utilization: f64,
    pub custom_metric_values: BTreeMap<String, f64>,
    pub predictions: BTreeMap<String, LoadPrediction>,
    /// The latest events, oldest first.
    pub recent_events: Vec<ScalingEvent>,
}

impl ScalerMetrics {
    pub fn to_component(&self, captured_at_unix: u64) -> ComponentMetrics {
        let mut m = ComponentMetrics::new("autoscaler", "autoscaler", captured_at_unix)
            .gauge("current_replicas", f64::from(self.current_replicas))
            .gauge("desired_replicas", f64::from(self.desired_replicas))
            .gauge("scale_up_count", self.scale_up_count as f64)
            .gauge("scale_down_count", self.scale_down_count as f64)
            .gauge("failed_actions", self.failed_actions as f64)
            .gauge("dropped_actions", self.dropped_actions as f64)
            .gauge("pending_actions", self.pending_actions as f64)
            .gauge("cpu_utilization", self.cpu_utilization)
            .gauge("memory_utilization", self.memory_utilization);
        for (name, prediction) in &self.predictions {
            m = m
                .gauge(&format!("predicted.{name}"), prediction.predicted_value)
                .gauge(&format!("confidence.{name}"), prediction.confidence);
        }
        m
    }
}

fn replicas(raw: f64) -> u32 {
    // Float-to-int casts saturate, and NaN becomes 0.
    raw.ceil() as u32
}

pub struct AutoScaler {
    config: AutoScalerConfig,
    clock: SharedClock,
    executor: Arc<dyn ScalingExecutor>,
    state: RwLock<ScaleState>,
    queue: ActionQueue,
    dropped_actions: AtomicU64,
    running: AtomicBool,
    stop: Mutex<CancellationToken>,
}

impl AutoScaler {
    pub fn new(
        config: AutoScalerConfig,
        clock: SharedClock,
        executor: Arc<dyn ScalingExecutor>,
    ) -> ScalerResult<Self> {
        config.validate()?;
        let predictors = if config.predictive_scaling {
            vec![
                LoadPredictor::new("cpu", config.predictors.cpu),
                LoadPredictor::new("memory", config.predictors.memory),
            ]
        } else {
            Vec::new()
        };
        let state = ScaleState {
            current_replicas: config.min_replicas,
            desired_replicas: config.min_replicas,
            last_scale_up: None,
            last_scale_down: None,
            last_scale_unix: None,
            scale_up_count: 0,
            scale_down_count: 0,
            failed_actions: 0,
            readings: Readings::default(),
            predictors,
            predictions: BTreeMap::new(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        };
        Ok(Self {
            queue: ActionQueue::new(config.action_queue_size),
            state: RwLock::new(state),
            dropped_actions: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            config,
            clock,
            executor,
        })
    }

    pub fn config(&self) -> &AutoScalerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn current_replicas(&self) -> u32 {
        self.read().current_replicas
    }

    pub fn desired_replicas(&self) -> u32 {
        self.read().desired_replicas
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ScaleState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ScaleState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_unix(&self) -> u64 {
        self.clock.unix_time().as_secs()
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Record the latest utilizations (0..1) and custom metric values.
    pub fn update_metrics(&self, cpu: f64, memory: f64, custom: &BTreeMap<String, f64>) {
        let now = self.clock.now();
        let now_unix = self.now_unix();
        let mut guard = self.write();
        let state = &mut *guard;

        state.readings.cpu = cpu;
        state.readings.memory = memory;
        state
            .readings
            .custom
            .extend(custom.iter().map(|(k, v)| (k.clone(), *v)));
        state.readings.updated_at = Some(now);

        for predictor in &mut state.predictors {
            let value = match predictor.name() {
                "cpu" => cpu,
                _ => memory,
            };
            predictor.record(LoadSample {
                at_unix: now_unix,
                value,
            });
            if let Some(prediction) = predictor.predict(now_unix) {
                state
                    .predictions
                    .insert(predictor.name().to_string(), prediction);
            }
        }
    }

    pub fn recommend(&self) -> Recommendation {
        self.recommend_from(&self.read())
    }

    fn recommend_from(&self, state: &ScaleState) -> Recommendation {
        let current = state.current_replicas;
        let base = f64::from(current);
        let readings = &state.readings;

        let per_resource = [
            (readings.cpu, self.config.target_cpu_utilization),
            (readings.memory, self.config.target_memory_utilization),
        ]
        .into_iter()
        .filter(|(observed, _)| *observed > 0.0)
        .map(|(observed, target)| replicas(base * observed / target));

        let custom = self.config.custom_metrics.iter().filter_map(|(name, metric)| {
            let value = *readings.custom.get(name)?;
            if value <= 0.0 || !metric.scale_direction.allows_up() {
                return None;
            }
            let unweighted = replicas(base * value / metric.target_value);
            Some((f64::from(unweighted) * metric.weight).floor() as u32)
        });

        let reactive = per_resource.chain(custom).max().unwrap_or(current);

        let predictive = if self.config.predictive_scaling {
            state
                .predictions
                .values()
                .filter(|p| p.is_confident())
                .map(|p| replicas(base * p.predicted_value))
                .max()
        } else {
            None
        };

        let desired = reactive
            .max(predictive.unwrap_or(0))
            .clamp(self.config.min_replicas, self.config.max_replicas);

        Recommendation {
            current,
            reactive,
            predictive,
            desired,
        }
    }

    fn cooldown_elapsed(&self, state: &ScaleState, action: ActionType, now: Instant) -> bool {
        let cooldown = self.config.cooldown(action.is_up());
        state
            .last_scale(action)
            .is_none_or(|at| now.saturating_duration_since(at) >= cooldown)
    }

    fn reason(&self, action: ActionType, readings: &Readings, predictive: bool) -> String {
        let cpu_target = self.config.target_cpu_utilization;
        let mem_target = self.config.target_memory_utilization;
        if action == ActionType::ScaleDown {
            return format!(
                "scale down: CPU {:.1}%, memory {:.1}% below targets",
                readings.cpu * 100.0,
                readings.memory * 100.0
            );
        }

        let mut reasons = Vec::new();
        if readings.cpu > cpu_target {
            reasons.push(format!(
                "CPU utilization {:.1}% > target {:.1}%",
                readings.cpu * 100.0,
                cpu_target * 100.0
            ));
        }
        if readings.memory > mem_target {
            reasons.push(format!(
                "memory utilization {:.1}% > target {:.1}%",
                readings.memory * 100.0,
                mem_target * 100.0
            ));
        }
        for (name, metric) in &self.config.custom_metrics {
            if let Some(value) = readings.custom.get(name).filter(|v| **v > metric.target_value) {
                reasons.push(format!("{name} {value:.2} > target {:.2}", metric.target_value));
            }
        }
        if predictive || reasons.is_empty() {
            reasons.push("predicted load above capacity".to_string());
        }
        format!("scale up: {}", reasons.join("; "))
    }

    /// One evaluation round. Returns the action it queued, if any.
    pub fn evaluate(&self) -> Option<ScalingAction> {
        let now = self.clock.now();
        let mut state = self.write();

        match state.readings.updated_at {
            None => {
                debug!("no metrics reported yet, skipping evaluation");
                return None;
            }
            Some(at) if now.saturating_duration_since(at) > self.config.metrics_window => {
                debug!(age = ?now.saturating_duration_since(at), "metrics are stale, skipping evaluation");
                return None;
            }
            Some(_) => {}
        }

        let rec = self.recommend_from(&state);
        state.desired_replicas = rec.desired;
        if rec.desired == rec.current {
            return None;
        }

        let kind = if rec.desired > rec.current {
            ActionType::ScaleUp
        } else {
            ActionType::ScaleDown
        };
        if !self.cooldown_elapsed(&state, kind, now) {
            debug!(action = %kind, from = rec.current, to = rec.desired, "within cooldown, holding");
            return None;
        }

        let predictive = rec.predictive.is_some_and(|p| p > rec.reactive);
        let action = ScalingAction {
            action: kind,
            from_replicas: rec.current,
            target_replicas: rec.desired,
            reason: self.reason(kind, &state.readings, predictive),
            metrics: state.readings.snapshot(),
            predictive,
            timestamp_unix: self.now_unix(),
        };
        drop(state);

        if let Some(evicted) = self.queue.push(action.clone()) {
            self.dropped_actions.fetch_add(1, Ordering::Relaxed);
            warn!(
                dropped_action = %evicted.action,
                dropped_target = evicted.target_replicas,
                "scaling action queue is full, dropped oldest pending action"
            );
        }
        info!(
            action = %action.action,
            from = action.from_replicas,
            to = action.target_replicas,
            predictive = action.predictive,
            reason = %action.reason,
            "scaling action queued"
        );
        Some(action)
    }

    /// Apply every queued action in order; returns how many were handed to
    /// the executor.
    pub async fn apply_pending(&self) -> usize {
        let mut applied = 0;
        while let Some(action) = self.queue.pop() {
            if self.execute(action).await {
                applied += 1;
            }
        }
        applied
    }

    async fn execute(&self, action: ScalingAction) -> bool {
        let from = {
            let state = self.read();
            if action.target_replicas == state.current_replicas {
                debug!(to = action.target_replicas, "scaling action already satisfied");
                return false;
            }
            if !self.cooldown_elapsed(&state, action.action, self.clock.now()) {
                debug!(action = %action.action, to = action.target_replicas, "scaling action superseded within cooldown");
                return false;
            }
            state.current_replicas
        };

        let ctx = Context::from_token(self.stop_token().child_token());
        let executor = Arc::clone(&self.executor);
        let submitted = action.clone();
        let started = self.clock.now();
        let outcome = join_outcome(
            tokio::spawn(async move { executor.apply(&ctx, &submitted).await }).await,
        );
        let elapsed = self.clock.now().saturating_duration_since(started);

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(TaskFailure::Panicked(msg)) => {
                error!(panic = %msg, "scaling executor panicked");
                Some(format!("executor panicked: {msg}"))
            }
            Err(TaskFailure::Cancelled) => Some("executor task cancelled".to_string()),
        };
        let success = error.is_none();

        let now_unix = self.now_unix();
        let mut state = self.write();
        if success {
            state.current_replicas = action.target_replicas;
            state.last_scale_unix = Some(now_unix);
            let applied_at = Some(self.clock.now());
            match action.action {
                ActionType::ScaleUp => {
                    state.scale_up_count += 1;
                    state.last_scale_up = applied_at;
                }
                ActionType::ScaleDown => {
                    state.scale_down_count += 1;
                    state.last_scale_down = applied_at;
                }
            }
            info!(
                action = %action.action,
                from,
                to = action.target_replicas,
                duration = ?elapsed,
                "scaling action completed"
            );
        } else {
            state.failed_actions += 1;
            error!(
                action = %action.action,
                to = action.target_replicas,
                duration = ?elapsed,
                error = error.as_deref().unwrap_or_default(),
                "scaling action failed"
            );
        }

        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(ScalingEvent {
            timestamp_unix: action.timestamp_unix,
            action: action.action,
            from_replicas: from,
            to_replicas: action.target_replicas,
            reason: action.reason,
            metrics: action.metrics,
            predictive: action.predictive,
            duration_ms: elapsed.as_millis() as u64,
            success,
            error,
        });
        true
    }

    /// Spawn the evaluator, executor and metrics-log tasks.
    pub fn start(self: &Arc<Self>, shutdown: &CancellationToken) -> ScalerResult<Vec<JoinHandle<()>>> {
        if !self.config.enabled {
            info!("auto-scaling is disabled");
            return Ok(Vec::new());
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ScalerError::AlreadyRunning);
        }
        let token = shutdown.child_token();
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        info!(
            min_replicas = self.config.min_replicas,
            max_replicas = self.config.max_replicas,
            target_cpu = self.config.target_cpu_utilization,
            predictive_scaling = self.config.predictive_scaling,
            "starting auto-scaler"
        );

        let evaluator = {
            let scaler = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { scaler.run_evaluator(token).await })
        };
        let executor = {
            let scaler = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { scaler.run_executor(token).await })
        };
        let logger = {
            let scaler = Arc::clone(self);
            tokio::spawn(async move { scaler.run_metrics_log(token).await })
        };
        Ok(vec![evaluator, executor, logger])
    }

    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("stopping auto-scaler");
        self.stop_token().cancel();
    }

    async fn run_evaluator(&self, shutdown: CancellationToken) {
        let mut ticker = self.clock.ticker(self.config.evaluation_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluate();
                }
                _ = shutdown.cancelled() => {
                    debug!("scaling evaluator shutting down");
                    break;
                }
            }
        }
    }

    async fn run_executor(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = self.queue.ready() => {
                    self.apply_pending().await;
                }
                _ = shutdown.cancelled() => {
                    debug!(pending = self.queue.len(), "scaling executor shutting down");
                    break;
                }
            }
        }
    }

    async fn run_metrics_log(&self, shutdown: CancellationToken) {
        let mut ticker = self.clock.ticker(self.config.metrics_log_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let m = self.metrics();
                    info!(
                        current_replicas = m.current_replicas,
                        desired_replicas = m.desired_replicas,
                        cpu_utilization = m.cpu_utilization * 100.0,
                        memory_utilization = m.memory_utilization * 100.0,
                        scale_up_count = m.scale_up_count,
                        scale_down_count = m.scale_down_count,
                        "auto-scaling metrics"
                    );
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Full retained history, oldest first.
    pub fn history(&self) -> Vec<ScalingEvent> {
        self.read().history.iter().cloned().collect()
    }

    pub fn metrics(&self) -> ScalerMetrics {
        let state = self.read();
        let skip = state.history.len().saturating_sub(RECENT_EVENTS);
        ScalerMetrics {
            current_replicas: state.current_replicas,
            desired_replicas: state.desired_replicas,
            min_replicas: self.config.min_replicas,
            max_replicas: self.config.max_replicas,
            last_scale_unix: state.last_scale_unix,
            scale_up_count: state.scale_up_count,
            scale_down_count: state.scale_down_count,
            failed_actions: state.failed_actions,
            dropped_actions: self.dropped_actions.load(Ordering::Relaxed),
            pending_actions: self.queue.len(),
            cpu_utilization: state.readings.cpu,
            memory_utilization: state.readings.memory,
            custom_metric_values: state.readings.custom.clone(),
            predictions: state.predictions.clone(),
            recent_events: state.history.iter().skip(skip).cloned().collect(),
        }
    }
}

impl Observable for AutoScaler {
    fn observe(&self) -> Vec<ComponentMetrics> {
        vec![self.metrics().to_component(self.now_unix())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CustomMetric, ScaleDirection};
    use async_trait::async_trait;
    use bulwark_core::ManualClock;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Succeeds unless told to fail; counts calls.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ScalingExecutor for Recorder {
        async fn apply(&self, _ctx: &Context, _action: &ScalingAction) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("cluster api unavailable");
            }
            Ok(())
        }
    }

    struct Panicker;

    #[async_trait]
    impl ScalingExecutor for Panicker {
        async fn apply(&self, _ctx: &Context, _action: &ScalingAction) -> anyhow::Result<()> {
            panic!("executor exploded");
        }
    }

    fn reactive_only(min: u32, max: u32) -> AutoScalerConfig {
        AutoScalerConfig {
            min_replicas: min,
            max_replicas: max,
            target_cpu_utilization: 0.5,
            target_memory_utilization: 0.8,
            scale_up_cooldown: Duration::from_secs(60),
            scale_down_cooldown: Duration::from_secs(300),
            predictive_scaling: false,
            ..Default::default()
        }
    }

    fn scaler(config: AutoScalerConfig, clock: &ManualClock) -> (AutoScaler, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let scaler = AutoScaler::new(config, clock.shared(), recorder.clone()).unwrap();
        (scaler, recorder)
    }

    fn none() -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    #[test]
    fn starts_at_min_and_waits_for_metrics() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 10), &clock);
        assert_eq!(scaler.current_replicas(), 2);
        assert!(scaler.evaluate().is_none());
    }

    #[test]
    fn reactive_takes_the_hungriest_resource() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 10), &clock);
        // cpu: ceil(2 * 0.6 / 0.5) = 3, memory: ceil(2 * 1.0 / 0.8) = 3
        scaler.update_metrics(0.6, 1.0, &none());
        assert_eq!(scaler.recommend().reactive, 3);

        // cpu: ceil(2 * 1.0 / 0.5) = 4
        scaler.update_metrics(1.0, 0.4, &none());
        let rec = scaler.recommend();
        assert_eq!(rec.reactive, 4);
        assert_eq!(rec.desired, 4);
    }

    #[test]
    fn zero_readings_hold_the_current_count() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 10), &clock);
        scaler.update_metrics(0.0, 0.0, &none());
        assert_eq!(scaler.recommend().reactive, 2);
        assert!(scaler.evaluate().is_none());
    }

    #[test]
    fn custom_metrics_are_weighted_and_directional() {
        let clock = ManualClock::new();
        let mut config = reactive_only(2, 20);
        config.custom_metrics.insert(
            "queue_depth".into(),
            CustomMetric {
                target_value: 100.0,
                weight: 0.5,
                scale_direction: ScaleDirection::Up,
            },
        );
        config.custom_metrics.insert(
            "idle_conns".into(),
            CustomMetric {
                target_value: 1.0,
                weight: 1.0,
                scale_direction: ScaleDirection::Down,
            },
        );
        let (scaler, _) = scaler(config, &clock);
        let custom = BTreeMap::from([("queue_depth".to_string(), 800.0), ("idle_conns".to_string(), 50.0)]);
        scaler.update_metrics(0.1, 0.1, &custom);
        // queue_depth: ceil(2 * 8) = 16, weighted to 8. idle_conns never scales up.
        assert_eq!(scaler.recommend().reactive, 8);
    }

    #[test]
    fn desired_is_clamped_to_bounds() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 5), &clock);
        scaler.update_metrics(50.0, 0.0, &none());
        assert_eq!(scaler.recommend().desired, 5);

        scaler.update_metrics(f64::INFINITY, f64::NAN, &none());
        assert_eq!(scaler.recommend().desired, 5);

        scaler.update_metrics(0.01, 0.01, &none());
        assert_eq!(scaler.recommend().desired, 2);
    }

    #[test]
    fn confident_prediction_raises_the_target() {
        let clock = ManualClock::new();
        let mut config = reactive_only(2, 20);
        config.predictive_scaling = true;
        let (scaler, _) = scaler(config, &clock);

        // cpu climbs 0.1 per sample; ten minutes out the line reaches 2.1.
        for i in 1..=10u32 {
            scaler.update_metrics(0.1 * f64::from(i), 0.0, &none());
        }
        let rec = scaler.recommend();
        // reactive: ceil(2 * 1.0 / 0.5) = 4, predictive: ceil(2 * 2.1) = 5
        assert_eq!(rec.reactive, 4);
        assert_eq!(rec.predictive, Some(5));
        assert_eq!(rec.desired, 5);

        let action = scaler.evaluate().unwrap();
        assert!(action.predictive);
        assert!(action.reason.contains("predicted load"));
    }

    #[test]
    fn predictions_need_ten_samples() {
        let clock = ManualClock::new();
        let mut config = reactive_only(2, 20);
        config.predictive_scaling = true;
        let (scaler, _) = scaler(config, &clock);
        for _ in 0..9 {
            scaler.update_metrics(0.4, 0.5, &none());
        }
        assert_eq!(scaler.recommend().predictive, None);
        assert!(scaler.metrics().predictions.is_empty());
    }

    #[test]
    fn stale_metrics_are_ignored() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 10), &clock);
        scaler.update_metrics(1.0, 0.0, &none());
        clock.advance(Duration::from_secs(301));
        assert!(scaler.evaluate().is_none());
    }

    #[tokio::test]
    async fn applies_and_records_a_scale_up() {
        let clock = ManualClock::new();
        let (scaler, recorder) = scaler(reactive_only(2, 10), &clock);
        scaler.update_metrics(1.0, 0.0, &none());

        let action = scaler.evaluate().unwrap();
        assert_eq!(action.action, ActionType::ScaleUp);
        assert_eq!(action.target_replicas, 4);
        assert!(action.reason.contains("CPU utilization 100.0% > target 50.0%"));
        assert_eq!(action.metrics["cpu_utilization"], 1.0);

        assert_eq!(scaler.apply_pending().await, 1);
        assert_eq!(scaler.current_replicas(), 4);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        let m = scaler.metrics();
        assert_eq!(m.scale_up_count, 1);
        assert_eq!(m.recent_events.len(), 1);
        assert!(m.recent_events[0].success);
        assert_eq!(m.recent_events[0].from_replicas, 2);
    }

    #[tokio::test]
    async fn cooldowns_are_per_direction_and_count_from_application() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(2, 20), &clock);

        scaler.update_metrics(1.0, 0.0, &none());
        scaler.evaluate().unwrap();
        scaler.apply_pending().await;
        assert_eq!(scaler.current_replicas(), 4);

        // Still hot, but the scale-up cooldown (60s) holds.
        clock.advance(Duration::from_secs(30));
        scaler.update_metrics(1.0, 0.0, &none());
        assert!(scaler.evaluate().is_none());
        assert_eq!(scaler.desired_replicas(), 8);

        // Scale-down was never applied, so it is free to go now.
        scaler.update_metrics(0.1, 0.0, &none());
        let down = scaler.evaluate().unwrap();
        assert_eq!(down.action, ActionType::ScaleDown);
        scaler.apply_pending().await;
        assert_eq!(scaler.current_replicas(), 2);

        clock.advance(Duration::from_secs(30));
        scaler.update_metrics(1.0, 0.0, &none());
        assert_eq!(scaler.evaluate().unwrap().action, ActionType::ScaleUp);
    }

    #[tokio::test]
    async fn failed_action_leaves_replicas_and_cooldown_untouched() {
        let clock = ManualClock::new();
        let (scaler, recorder) = scaler(reactive_only(2, 10), &clock);
        recorder.fail.store(true, Ordering::SeqCst);

        scaler.update_metrics(1.0, 0.0, &none());
        scaler.evaluate().unwrap();
        scaler.apply_pending().await;
        assert_eq!(scaler.current_replicas(), 2);

        let history = scaler.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].error.as_deref(), Some("cluster api unavailable"));
        assert_eq!(scaler.metrics().failed_actions, 1);

        // No cooldown was started, so the next round retries immediately.
        recorder.fail.store(false, Ordering::SeqCst);
        assert!(scaler.evaluate().is_some());
        scaler.apply_pending().await;
        assert_eq!(scaler.current_replicas(), 4);
    }

    #[tokio::test]
    async fn executor_panic_is_recorded_as_failure() {
        let clock = ManualClock::new();
        let scaler = AutoScaler::new(reactive_only(2, 10), clock.shared(), Arc::new(Panicker)).unwrap();
        scaler.update_metrics(1.0, 0.0, &none());
        scaler.evaluate().unwrap();
        scaler.apply_pending().await;

        assert_eq!(scaler.current_replicas(), 2);
        let history = scaler.history();
        assert!(history[0].error.as_deref().unwrap().contains("executor exploded"));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_stale_actions_are_skipped() {
        let clock = ManualClock::new();
        let mut config = reactive_only(2, 20);
        config.action_queue_size = 2;
        let (scaler, recorder) = scaler(config, &clock);

        for cpu in [0.6, 0.8, 1.0] {
            scaler.update_metrics(cpu, 0.0, &none());
            scaler.evaluate().unwrap();
        }
        let m = scaler.metrics();
        assert_eq!(m.dropped_actions, 1);
        assert_eq!(m.pending_actions, 2);

        // The first survivor applies; the second is already satisfied.
        assert_eq!(scaler.apply_pending().await, 1);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scaler.current_replicas(), 4);
    }

    #[tokio::test]
    async fn history_keeps_the_last_hundred_events() {
        let clock = ManualClock::new();
        let mut config = reactive_only(1, 2);
        config.scale_up_cooldown = Duration::ZERO;
        config.scale_down_cooldown = Duration::ZERO;
        let (scaler, _) = scaler(config, &clock);

        for i in 0..120 {
            let cpu = if i % 2 == 0 { 1.0 } else { 0.1 };
            scaler.update_metrics(cpu, 0.0, &none());
            scaler.evaluate().unwrap();
            scaler.apply_pending().await;
        }
        assert_eq!(scaler.history().len(), 100);
        let m = scaler.metrics();
        assert_eq!(m.recent_events.len(), 10);
        assert_eq!(m.scale_up_count + m.scale_down_count, 120);
    }

    #[test]
    fn observe_reports_replicas() {
        let clock = ManualClock::new();
        let (scaler, _) = scaler(reactive_only(3, 10), &clock);
        let snapshot = scaler.observe();
        assert_eq!(snapshot[0].component, "autoscaler");
        assert_eq!(snapshot[0].get("current_replicas"), Some(3.0));
    }
}
