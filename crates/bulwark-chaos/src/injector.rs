use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bulwark_core::duration::human_opt;
use bulwark_core::{format_duration, ComponentMetrics, Context, Observable, SharedClock};
use bulwark_http::{Handler, Request, Response};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ChaosConfig, Fault, FaultKind, ScenarioConfig};
use crate::error::{ChaosError, ChaosResult};
use crate::stress::{self, StressOutcome};

/// Runtime state of one configured scenario.
struct Scenario {
    name: String,
    config: ScenarioConfig,
    fault: Fault,
    active: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    /// Unix seconds, 0 when never started.
    started_at_unix: AtomicU64,
    faults: AtomicU64,
    last_fault_unix: AtomicU64,
}

impl Scenario {
    fn new(name: &str, config: &ScenarioConfig) -> Self {
        Self {
            name: name.to_string(),
            fault: config.fault(),
            config: config.clone(),
            active: AtomicBool::new(false),
            started_at: Mutex::new(None),
            started_at_unix: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            last_fault_unix: AtomicU64::new(0),
        }
    }

    fn activate(&self, now: Instant, now_unix: u64) {
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.started_at_unix.store(now_unix, Ordering::Relaxed);
        self.active.store(true, Ordering::Release);
    }

    fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    /// Active and within its duration. Expiry is applied here, lazily.
    fn is_live(&self, now: Instant) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return false;
        }
        let Some(limit) = self.config.duration else {
            return true;
        };
        let started = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = started.is_some_and(|at| now.saturating_duration_since(at) >= limit);
        if expired && self.deactivate() {
            info!(scenario = %self.name, duration = ?limit, "chaos scenario expired");
        }
        !expired
    }

    fn record(&self, now_unix: u64) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        self.last_fault_unix.store(now_unix, Ordering::Relaxed);
    }

    fn metrics(&self) -> ScenarioMetrics {
        let nonzero = |v: u64| (v != 0).then_some(v);
        ScenarioMetrics {
            name: self.name.clone(),
            fault_type: self.fault.kind(),
            active: self.active.load(Ordering::Acquire),
            failure_rate: self.config.failure_rate,
            duration: self.config.duration,
            started_at_unix: nonzero(self.started_at_unix.load(Ordering::Relaxed)),
            fault_count: self.faults.load(Ordering::Relaxed),
            last_fault_unix: nonzero(self.last_fault_unix.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    pub name: String,
    pub fault_type: FaultKind,
    pub active: bool,
    pub failure_rate: f64,
    #[serde(with = "human_opt")]
    pub duration: Option<Duration>,
    pub started_at_unix: Option<u64>,
    pub fault_count: u64,
    pub last_fault_unix: Option<u64>,
}

/// Snapshot returned by [`FaultInjector::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChaosMetrics {
    pub enabled: bool,
    pub running: bool,
    pub safe_mode: bool,
    pub active_scenarios: usize,
    pub total_faults: u64,
    pub faults_by_type: BTreeMap<FaultKind, u64>,
    pub faults_by_scenario: BTreeMap<String, u64>,
    pub last_fault_unix: Option<u64>,
    pub in_flight: usize,
    /// Selected faults dropped because `max_concurrent_faults` were in flight.
    pub skipped_faults: u64,
    /// Destructive faults turned into no-ops by safe mode.
    pub safe_mode_skips: u64,
    pub scenarios: Vec<ScenarioMetrics>,
}

impl ChaosMetrics {
    pub fn to_component(&self, captured_at_unix: u64) -> ComponentMetrics {
        let mut m = ComponentMetrics::new("chaos_injector", "chaos", captured_at_unix)
            .gauge("enabled", f64::from(u8::from(self.enabled)))
            .gauge("running", f64::from(u8::from(self.running)))
            .gauge("active_scenarios", self.active_scenarios as f64)
            .gauge("total_faults", self.total_faults as f64)
            .gauge("in_flight", self.in_flight as f64)
            .gauge("skipped_faults", self.skipped_faults as f64)
            .gauge("safe_mode_skips", self.safe_mode_skips as f64);
        for (name, count) in &self.faults_by_scenario {
            m = m.gauge(&format!("faults.{name}"), *count as f64);
        }
        m
    }
}

/// A fault chosen for one request, holding its concurrency slot.
pub struct Injection {
    pub scenario: String,
    pub fault: Fault,
    _permit: OwnedSemaphorePermit,
}

/// Declarative request-level chaos.
///
/// Each request passes three gates: a trial at `global_failure_rate`, the
/// first live scenario (by name) targeting the path, and a trial at that
/// scenario's `failure_rate`. Chosen faults then need one of the
/// `max_concurrent_faults` slots; without one the request passes through.
pub struct FaultInjector {
    config: ChaosConfig,
    clock: SharedClock,
    enabled: AtomicBool,
    running: AtomicBool,
    /// Sorted by name.
    scenarios: Vec<Scenario>,
    rng: Mutex<StdRng>,
    permits: Arc<Semaphore>,
    total_faults: AtomicU64,
    last_fault_unix: AtomicU64,
    skipped_faults: AtomicU64,
    safe_mode_skips: AtomicU64,
    /// Replaced on every start; cancelled on stop.
    shutdown: Mutex<CancellationToken>,
}

impl FaultInjector {
    pub fn new(config: ChaosConfig, clock: SharedClock) -> ChaosResult<Self> {
        Self::with_rng(config, clock, StdRng::from_os_rng())
    }

    /// Deterministic trials and latency draws.
    pub fn with_seed(config: ChaosConfig, clock: SharedClock, seed: u64) -> ChaosResult<Self> {
        Self::with_rng(config, clock, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ChaosConfig, clock: SharedClock, rng: StdRng) -> ChaosResult<Self> {
        config.validate()?;
        let scenarios = config
            .scenarios
            .iter()
            .map(|(name, scenario)| Scenario::new(name, scenario))
            .collect();
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            running: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(config.max_concurrent_faults)),
            scenarios,
            rng: Mutex::new(rng),
            total_faults: AtomicU64::new(0),
            last_fault_unix: AtomicU64::new(0),
            skipped_faults: AtomicU64::new(0),
            safe_mode_skips: AtomicU64::new(0),
            shutdown: Mutex::new(CancellationToken::new()),
            config,
            clock,
        })
    }

    pub fn config(&self) -> &ChaosConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Runtime kill switch; a disabled injector passes every request through.
    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            info!(enabled, "chaos injection toggled");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Activate every scenario marked `enabled`. A no-op while disabled.
    pub fn start(&self) -> ChaosResult<()> {
        if !self.is_enabled() {
            info!("chaos engineering is disabled");
            return Ok(());
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ChaosError::AlreadyRunning);
        }
        *self.shutdown.lock().unwrap_or_else(PoisonError::into_inner) = CancellationToken::new();

        info!(
            safe_mode = self.config.safe_mode,
            global_failure_rate = self.config.global_failure_rate,
            max_concurrent_faults = self.config.max_concurrent_faults,
            "starting chaos fault injector"
        );
        let (now, now_unix) = (self.clock.now(), self.now_unix());
        for scenario in self.scenarios.iter().filter(|s| s.config.enabled) {
            scenario.activate(now, now_unix);
            info!(scenario = %scenario.name, fault_type = %scenario.fault.kind(), "started chaos scenario");
        }
        Ok(())
    }

    /// Deactivate all scenarios and cut short any fault still sleeping.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        info!("stopping chaos fault injector");
        self.shutdown_token().cancel();
        for scenario in &self.scenarios {
            if scenario.deactivate() {
                info!(scenario = %scenario.name, "stopped chaos scenario");
            }
        }
    }

    pub fn scenario_names(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.name.as_str()).collect()
    }

    /// (Re)start a scenario; its duration counts from now.
    pub fn enable_scenario(&self, name: &str) -> ChaosResult<()> {
        let scenario = self.scenario(name)?;
        scenario.activate(self.clock.now(), self.now_unix());
        info!(scenario = %name, "chaos scenario enabled");
        Ok(())
    }

    pub fn disable_scenario(&self, name: &str) -> ChaosResult<()> {
        if self.scenario(name)?.deactivate() {
            info!(scenario = %name, "chaos scenario disabled");
        }
        Ok(())
    }

    fn scenario(&self, name: &str) -> ChaosResult<&Scenario> {
        self.scenarios
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ChaosError::UnknownScenario(name.to_string()))
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn now_unix(&self) -> u64 {
        self.clock.unix_time().as_secs()
    }

    fn roll(&self, rate: f64) -> bool {
        rate > 0.0 && self.rng.lock().unwrap_or_else(PoisonError::into_inner).random::<f64>() < rate
    }

    fn draw_latency(&self, min: Duration, max: Duration) -> Duration {
        let nanos = |d: Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let (lo, hi) = (nanos(min), nanos(max));
        if lo >= hi {
            return min;
        }
        let drawn = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(lo..=hi);
        Duration::from_nanos(drawn)
    }

    fn record_fault(&self, scenario: &Scenario) {
        let now_unix = self.now_unix();
        scenario.record(now_unix);
        self.total_faults.fetch_add(1, Ordering::Relaxed);
        self.last_fault_unix.store(now_unix, Ordering::Relaxed);
    }

    /// Decide whether the request to `path` gets a fault, and which.
    pub fn select(&self, path: &str) -> Option<Injection> {
        if !self.is_enabled() || !self.is_running() {
            return None;
        }
        if !self.roll(self.config.global_failure_rate) {
            return None;
        }
        let now = self.clock.now();
        let scenario = self
            .scenarios
            .iter()
            .find(|s| s.is_live(now) && s.config.targets(path))?;
        if !self.roll(scenario.config.failure_rate) {
            return None;
        }

        let kind = scenario.fault.kind();
        if self.config.safe_mode && kind.is_destructive() {
            self.safe_mode_skips.fetch_add(1, Ordering::Relaxed);
            warn!(scenario = %scenario.name, fault_type = %kind, path, "destructive fault skipped (safe mode enabled)");
            return None;
        }
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            self.skipped_faults.fetch_add(1, Ordering::Relaxed);
            debug!(scenario = %scenario.name, path, "fault skipped, concurrency cap reached");
            return None;
        };

        self.record_fault(scenario);
        debug!(scenario = %scenario.name, fault_type = %kind, path, "injecting chaos fault");
        Some(Injection {
            scenario: scenario.name.clone(),
            fault: scenario.fault.clone(),
            _permit: permit,
        })
    }

    /// Serve `req`, injecting a fault when one is selected.
    pub async fn handle(&self, req: Request, inner: &dyn Handler) -> Response {
        match self.select(req.path()) {
            Some(injection) => self.inject(injection, req, inner).await,
            None => inner.call(req).await,
        }
    }

    /// Sleep unless the injector stops first; false when cut short.
    async fn pause(&self, duration: Duration) -> bool {
        let shutdown = self.shutdown_token();
        tokio::select! {
            _ = self.clock.sleep(duration) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    async fn inject(&self, injection: Injection, req: Request, inner: &dyn Handler) -> Response {
        match &injection.fault {
            Fault::Latency {
                min,
                max,
                return_error,
            } => {
                let delay = self.draw_latency(*min, *max);
                debug!(latency = ?delay, path = req.path(), "injecting latency");
                if !self.pause(delay).await {
                    return inner.call(req).await;
                }
                let resp = if *return_error {
                    Response::text(408, "Request Timeout")
                } else {
                    inner.call(req).await
                };
                resp.with_header("X-Chaos-Latency", format_duration(delay))
            }
            Fault::Error { status, message } => {
                Response::text(*status, message.clone()).with_header("X-Chaos-Error", "true")
            }
            Fault::Timeout(timeout) => {
                if !self.pause(*timeout).await {
                    return inner.call(req).await;
                }
                Response::text(408, "Request Timeout").with_header("X-Chaos-Timeout", "true")
            }
            Fault::Network => {
                Response::text(502, "Bad Gateway").with_header("X-Chaos-Network", "true")
            }
            Fault::Memory { .. } | Fault::Cpu { .. } => {
                self.spawn_stress(injection);
                inner.call(req).await
            }
        }
    }

    /// Run a memory or CPU fault in the background; it keeps its slot
    /// until the hold ends or the injector stops.
    fn spawn_stress(&self, injection: Injection) {
        let clock = Arc::clone(&self.clock);
        let ctx = Context::from_token(self.shutdown_token().child_token());
        tokio::spawn(async move {
            let Injection {
                scenario,
                fault,
                _permit,
            } = injection;
            let outcome = match fault {
                Fault::Memory { bytes, hold } => {
                    stress::memory_pressure(clock.as_ref(), &ctx, bytes, hold).await
                }
                Fault::Cpu { workers, hold } => {
                    stress::cpu_stress(clock.as_ref(), &ctx, workers, hold).await
                }
                _ => return,
            };
            debug!(scenario = %scenario, outcome = ?outcome, "background stress finished");
        });
    }

    /// Allocate and hold the memory configured on a `memory` scenario.
    pub async fn inject_memory_pressure(&self, ctx: &Context, scenario: &str) -> ChaosResult<StressOutcome> {
        let scenario = self.scenario(scenario)?;
        let Fault::Memory { bytes, hold } = scenario.fault else {
            return Err(self.mismatch(scenario, FaultKind::Memory));
        };
        if self.skip_in_safe_mode(scenario) {
            return Ok(StressOutcome::Skipped);
        }
        self.record_fault(scenario);
        Ok(stress::memory_pressure(self.clock.as_ref(), ctx, bytes, hold).await)
    }

    /// Spin the workers configured on a `cpu` scenario.
    pub async fn inject_cpu_stress(&self, ctx: &Context, scenario: &str) -> ChaosResult<StressOutcome> {
        let scenario = self.scenario(scenario)?;
        let Fault::Cpu { workers, hold } = scenario.fault else {
            return Err(self.mismatch(scenario, FaultKind::Cpu));
        };
        if self.skip_in_safe_mode(scenario) {
            return Ok(StressOutcome::Skipped);
        }
        self.record_fault(scenario);
        Ok(stress::cpu_stress(self.clock.as_ref(), ctx, workers, hold).await)
    }

    fn mismatch(&self, scenario: &Scenario, expected: FaultKind) -> ChaosError {
        ChaosError::FaultMismatch {
            scenario: scenario.name.clone(),
            expected,
            actual: scenario.fault.kind(),
        }
    }

    fn skip_in_safe_mode(&self, scenario: &Scenario) -> bool {
        if !self.config.safe_mode {
            return false;
        }
        self.safe_mode_skips.fetch_add(1, Ordering::Relaxed);
        warn!(scenario = %scenario.name, fault_type = %scenario.fault.kind(), "stress injection skipped (safe mode enabled)");
        true
    }

    /// Apply duration expiry to every scenario; returns how many remain live.
    pub fn expire_scenarios(&self) -> usize {
        let now = self.clock.now();
        self.scenarios.iter().filter(|s| s.is_live(now)).count()
    }

    pub async fn run_monitor(&self, shutdown: CancellationToken) {
        let mut ticker = self.clock.ticker(self.config.monitoring_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.expire_scenarios();
                    let m = self.metrics();
                    info!(
                        active_scenarios = m.active_scenarios,
                        total_faults = m.total_faults,
                        in_flight = m.in_flight,
                        skipped_faults = m.skipped_faults,
                        last_fault_unix = ?m.last_fault_unix,
                        "chaos engineering metrics"
                    );
                }
                _ = shutdown.cancelled() => {
                    debug!("chaos monitor shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn_monitor(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let injector = Arc::clone(self);
        tokio::spawn(async move { injector.run_monitor(shutdown).await })
    }

    pub fn metrics(&self) -> ChaosMetrics {
        let now = self.clock.now();
        let scenarios: Vec<ScenarioMetrics> = self
            .scenarios
            .iter()
            .map(|s| {
                s.is_live(now);
                s.metrics()
            })
            .collect();

        let mut faults_by_type = BTreeMap::new();
        let mut faults_by_scenario = BTreeMap::new();
        for s in &scenarios {
            *faults_by_type.entry(s.fault_type).or_insert(0) += s.fault_count;
            faults_by_scenario.insert(s.name.clone(), s.fault_count);
        }
        let last = self.last_fault_unix.load(Ordering::Relaxed);

        ChaosMetrics {
            enabled: self.is_enabled(),
            running: self.is_running(),
            safe_mode: self.config.safe_mode,
            active_scenarios: scenarios.iter().filter(|s| s.active).count(),
            total_faults: self.total_faults.load(Ordering::Relaxed),
            faults_by_type,
            faults_by_scenario,
            last_fault_unix: (last != 0).then_some(last),
            in_flight: self
                .config
                .max_concurrent_faults
                .saturating_sub(self.permits.available_permits()),
            skipped_faults: self.skipped_faults.load(Ordering::Relaxed),
            safe_mode_skips: self.safe_mode_skips.load(Ordering::Relaxed),
            scenarios,
        }
    }
}

impl Observable for FaultInjector {
    fn observe(&self) -> Vec<ComponentMetrics> {
        vec![self.metrics().to_component(self.now_unix())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FaultParameters;
    use bulwark_core::{system_clock, ManualClock};
    use bulwark_http::handler_fn;

    fn scenario(kind: FaultKind, targets: &[&str]) -> ScenarioConfig {
        ScenarioConfig {
            enabled: true,
            failure_rate: 1.0,
            fault_type: kind,
            target_endpoints: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn config(scenarios: Vec<(&str, ScenarioConfig)>) -> ChaosConfig {
        ChaosConfig {
            enabled: true,
            global_failure_rate: 1.0,
            safe_mode: true,
            scenarios: scenarios
                .into_iter()
                .map(|(name, s)| (name.to_string(), s))
                .collect(),
            ..Default::default()
        }
    }

    fn started(config: ChaosConfig, clock: SharedClock) -> FaultInjector {
        let injector = FaultInjector::with_seed(config, clock, 7).unwrap();
        injector.start().unwrap();
        injector
    }

    fn ok_handler() -> bulwark_http::BoxHandler {
        handler_fn(|_req| async { Response::ok("ok") })
    }

    #[test]
    fn nothing_is_injected_before_start() {
        let injector =
            FaultInjector::with_seed(config(vec![("e", scenario(FaultKind::Error, &[]))]), system_clock(), 1)
                .unwrap();
        assert!(injector.select("/a").is_none());
        assert_eq!(injector.metrics().total_faults, 0);
    }

    #[test]
    fn disabled_config_makes_start_a_no_op() {
        let mut cfg = config(vec![("e", scenario(FaultKind::Error, &[]))]);
        cfg.enabled = false;
        let injector = FaultInjector::with_seed(cfg, system_clock(), 1).unwrap();
        injector.start().unwrap();
        assert!(!injector.is_running());
        assert!(injector.select("/a").is_none());
    }

    #[test]
    fn double_start_is_rejected() {
        let injector = started(config(vec![]), system_clock());
        assert!(matches!(injector.start(), Err(ChaosError::AlreadyRunning)));
    }

    #[test]
    fn first_matching_scenario_by_name_wins() {
        let injector = started(
            config(vec![
                ("b_error", scenario(FaultKind::Error, &["/x"])),
                ("a_timeout", scenario(FaultKind::Timeout, &["/y"])),
                ("c_any", scenario(FaultKind::Network, &[])),
            ]),
            system_clock(),
        );
        assert_eq!(injector.select("/x").unwrap().scenario, "b_error");
        assert_eq!(injector.select("/y").unwrap().scenario, "a_timeout");
        // Only the catch-all network scenario matches, and safe mode skips it.
        assert!(injector.select("/z").is_none());
        let m = injector.metrics();
        assert_eq!(m.faults_by_scenario["b_error"], 1);
        assert_eq!(m.faults_by_type[&FaultKind::Timeout], 1);
    }

    #[test]
    fn zero_rates_never_inject() {
        let mut cfg = config(vec![("e", scenario(FaultKind::Error, &[]))]);
        cfg.global_failure_rate = 0.0;
        let injector = started(cfg, system_clock());
        assert!((0..100).all(|_| injector.select("/a").is_none()));

        let mut cfg = config(vec![("e", ScenarioConfig {
            failure_rate: 0.0,
            ..scenario(FaultKind::Error, &[])
        })]);
        cfg.global_failure_rate = 1.0;
        let injector = started(cfg, system_clock());
        assert!((0..100).all(|_| injector.select("/a").is_none()));
    }

    #[test]
    fn partial_rates_inject_roughly_proportionally() {
        let mut cfg = config(vec![("e", ScenarioConfig {
            failure_rate: 0.5,
            ..scenario(FaultKind::Error, &[])
        })]);
        cfg.global_failure_rate = 0.5;
        let injector = started(cfg, system_clock());
        let hits = (0..4000).filter(|_| injector.select("/a").is_some()).count();
        // Expected 1000 at 0.25.
        assert!((800..1200).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn concurrency_cap_skips_excess_faults() {
        let mut cfg = config(vec![("e", scenario(FaultKind::Error, &[]))]);
        cfg.max_concurrent_faults = 2;
        let injector = started(cfg, system_clock());

        let first = injector.select("/a");
        let second = injector.select("/a");
        assert!(first.is_some() && second.is_some());
        assert!(injector.select("/a").is_none());

        let m = injector.metrics();
        assert_eq!(m.in_flight, 2);
        assert_eq!(m.skipped_faults, 1);
        assert_eq!(m.total_faults, 2);

        drop(first);
        assert!(injector.select("/a").is_some());
    }

    #[test]
    fn safe_mode_skips_destructive_faults() {
        let injector = started(
            config(vec![("net", scenario(FaultKind::Network, &[]))]),
            system_clock(),
        );
        assert!(injector.select("/a").is_none());
        let m = injector.metrics();
        assert_eq!(m.safe_mode_skips, 1);
        assert_eq!(m.total_faults, 0);
    }

    #[tokio::test]
    async fn network_fault_answers_bad_gateway_outside_safe_mode() {
        let mut cfg = config(vec![("net", scenario(FaultKind::Network, &[]))]);
        cfg.safe_mode = false;
        let injector = started(cfg, system_clock());
        let resp = injector.handle(Request::get("/a"), ok_handler().as_ref()).await;
        assert_eq!(resp.status(), 502);
        assert_eq!(resp.headers().get("X-Chaos-Network"), Some("true"));
    }

    #[tokio::test]
    async fn scenario_expires_after_its_duration() {
        let clock = ManualClock::new();
        let injector = started(
            config(vec![("brief", ScenarioConfig {
                duration: Some(Duration::from_secs(10)),
                ..scenario(FaultKind::Error, &[])
            })]),
            clock.shared(),
        );
        assert!(injector.select("/a").is_some());

        clock.advance(Duration::from_secs(10));
        assert!(injector.select("/a").is_none());
        assert_eq!(injector.metrics().active_scenarios, 0);

        // Re-enabling restarts the duration window.
        injector.enable_scenario("brief").unwrap();
        assert!(injector.select("/a").is_some());
    }

    #[test]
    fn runtime_toggles() {
        let injector = started(
            config(vec![("e", scenario(FaultKind::Error, &[]))]),
            system_clock(),
        );
        injector.disable_scenario("e").unwrap();
        assert!(injector.select("/a").is_none());
        injector.enable_scenario("e").unwrap();
        assert!(injector.select("/a").is_some());

        injector.set_enabled(false);
        assert!(injector.select("/a").is_none());
        assert!(matches!(
            injector.enable_scenario("missing"),
            Err(ChaosError::UnknownScenario(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fault_sleeps_then_answers_408() {
        let injector = started(
            config(vec![("t", ScenarioConfig {
                parameters: FaultParameters {
                    timeout: Duration::from_secs(2),
                    ..Default::default()
                },
                ..scenario(FaultKind::Timeout, &[])
            })]),
            system_clock(),
        );
        let begin = Instant::now();
        let resp = injector.handle(Request::get("/a"), ok_handler().as_ref()).await;
        assert!(begin.elapsed() >= Duration::from_secs(2));
        assert_eq!(resp.status(), 408);
        assert_eq!(resp.headers().get("X-Chaos-Timeout"), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_sleeping_faults_short() {
        let injector = Arc::new(started(
            config(vec![("t", scenario(FaultKind::Timeout, &[]))]),
            system_clock(),
        ));
        let call = {
            let injector = Arc::clone(&injector);
            tokio::spawn(async move { injector.handle(Request::get("/a"), ok_handler().as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        injector.stop();

        let resp = call.await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(!injector.is_running());
        assert_eq!(injector.metrics().active_scenarios, 0);
    }

    #[tokio::test]
    async fn stress_injection_honors_safe_mode_and_fault_type() {
        let injector = started(
            config(vec![
                ("mem", scenario(FaultKind::Memory, &[])),
                ("err", scenario(FaultKind::Error, &[])),
            ]),
            system_clock(),
        );
        let ctx = Context::background();
        let outcome = injector.inject_memory_pressure(&ctx, "mem").await.unwrap();
        assert_eq!(outcome, StressOutcome::Skipped);
        assert!(matches!(
            injector.inject_cpu_stress(&ctx, "err").await,
            Err(ChaosError::FaultMismatch { expected: FaultKind::Cpu, actual: FaultKind::Error, .. })
        ));
    }

    #[tokio::test]
    async fn memory_pressure_runs_outside_safe_mode() {
        let clock = ManualClock::new();
        let mut cfg = config(vec![("mem", ScenarioConfig {
            parameters: FaultParameters {
                memory_size: 1024,
                stress_duration: Duration::from_secs(1),
                ..Default::default()
            },
            ..scenario(FaultKind::Memory, &[])
        })]);
        cfg.safe_mode = false;
        let injector = started(cfg, clock.shared());
        let ctx = Context::background();
        ctx.cancel();
        let outcome = injector.inject_memory_pressure(&ctx, "mem").await.unwrap();
        assert_eq!(outcome, StressOutcome::Cancelled);
        assert_eq!(injector.metrics().faults_by_type[&FaultKind::Memory], 1);
    }

    #[tokio::test]
    async fn monitor_stops_on_shutdown() {
        let clock = ManualClock::new();
        let injector = Arc::new(started(config(vec![]), clock.shared()));
        let shutdown = CancellationToken::new();
        let handle = injector.spawn_monitor(shutdown.clone());
        clock.advance(Duration::from_secs(60));
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn observe_reports_chaos_component() {
        let injector = started(
            config(vec![("e", scenario(FaultKind::Error, &[]))]),
            system_clock(),
        );
        injector.select("/a");
        let snapshot = injector.observe();
        assert_eq!(snapshot[0].component, "chaos_injector");
        assert_eq!(snapshot[0].get("total_faults"), Some(1.0));
        assert_eq!(snapshot[0].get("faults.e"), Some(1.0));
    }
}
