use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bulwark_core::{ComponentMetrics, Context, KvError, KvResult, KvStore, Observable, SharedClock};
use bulwark_http::Request;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::algorithm::{counter_for, Counter, Decision};
use crate::config::{Algorithm, LimitRule, RateLimitConfig};
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::RateLimitKey;

type SharedCounter = Arc<Mutex<Box<dyn Counter>>>;

enum Backend {
    Local {
        windows: RwLock<HashMap<RateLimitKey, SharedCounter>>,
    },
    Distributed {
        kv: Arc<dyn KvStore>,
        /// Cleared after the store reports `incr` as unsupported.
        incr_supported: AtomicBool,
    },
}

#[derive(Debug, Default)]
struct Counters {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    kv_errors: AtomicU64,
}

/// Point-in-time limiter statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub algorithm: Algorithm,
    pub distributed: bool,
    pub tracked_keys: usize,
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub kv_errors: u64,
}

/// Result of checking every key resolved from a request.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// The denying decision, or the tightest allowing one.
    pub decision: Decision,
    pub denied_by: Option<RateLimitKey>,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        self.denied_by.is_none()
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    backend: Backend,
    counters: Counters,
}

impl RateLimiter {
    /// In-process limiter. A `distributed` config without a store falls back
    /// to local windows.
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> RateLimitResult<Self> {
        Self::build(config, clock, None)
    }

    pub fn with_kv_store(
        config: RateLimitConfig,
        clock: SharedClock,
        kv: Arc<dyn KvStore>,
    ) -> RateLimitResult<Self> {
        Self::build(config, clock, Some(kv))
    }

    fn build(
        config: RateLimitConfig,
        clock: SharedClock,
        kv: Option<Arc<dyn KvStore>>,
    ) -> RateLimitResult<Self> {
        config.validate()?;

        let backend = match kv {
            Some(kv) if config.distributed => Backend::Distributed {
                kv,
                incr_supported: AtomicBool::new(true),
            },
            _ => {
                if config.distributed {
                    warn!("distributed rate limiting requested without a kv store, using local windows");
                }
                Backend::Local {
                    windows: RwLock::new(HashMap::new()),
                }
            }
        };

        let limiter = Self {
            config,
            clock,
            backend,
            counters: Counters::default(),
        };
        info!(
            algorithm = limiter.config.algorithm.as_str(),
            distributed = limiter.is_distributed(),
            default_limit = limiter.config.default_limit,
            "rate limiter configured"
        );
        Ok(limiter)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self.backend, Backend::Distributed { .. })
    }

    /// Admit or reject one unit of work against `key`.
    pub async fn check(&self, ctx: &Context, key: &RateLimitKey) -> Decision {
        let rule = self.config.rule_for(key);
        self.counters.checks.fetch_add(1, Ordering::Relaxed);

        let decision = match &self.backend {
            Backend::Local { windows } => self.check_local(windows, key, rule),
            Backend::Distributed { kv, incr_supported } => {
                self.check_distributed(ctx, kv.as_ref(), incr_supported, key, rule)
                    .await
            }
        };

        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "rate limit denied"
            );
        }
        decision
    }

    /// Like [`check`](Self::check) but denial is an error.
    pub async fn acquire(&self, ctx: &Context, key: &RateLimitKey) -> RateLimitResult<Decision> {
        let decision = self.check(ctx, key).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitError::Exceeded {
                key: key.to_string(),
                retry_after: decision.retry_after,
            })
        }
    }

    /// Keys for a request, in check order: global, ip, user, endpoint.
    pub fn keys_for(&self, req: &Request) -> Vec<RateLimitKey> {
        let path = req.path();
        let mut keys = vec![RateLimitKey::global()];
        if let Some(ip) = client_ip(req) {
            keys.push(RateLimitKey::ip(ip, path));
        }
        if let Some(user) = req
            .headers()
            .get("X-User-ID")
            .map(str::trim)
            .filter(|u| !u.is_empty())
        {
            keys.push(RateLimitKey::user(user, path));
        }
        keys.push(RateLimitKey::endpoint(path));
        keys
    }

    /// Check each key of `req` in order, stopping at the first denial.
    pub async fn check_request(&self, ctx: &Context, req: &Request) -> Verdict {
        let mut tightest: Option<Decision> = None;
        for key in self.keys_for(req) {
            let decision = self.check(ctx, &key).await;
            if !decision.allowed {
                return Verdict {
                    decision,
                    denied_by: Some(key),
                };
            }
            if tightest.is_none_or(|t| decision.remaining < t.remaining) {
                tightest = Some(decision);
            }
        }
        let fallback = Decision::allow(self.config.default_limit, self.config.default_limit, Duration::ZERO);
        Verdict {
            decision: tightest.unwrap_or(fallback),
            denied_by: None,
        }
    }

    /// Unix seconds at which `decision` resets, rounded up.
    pub fn reset_at_unix(&self, decision: &Decision) -> u64 {
        let at = self.clock.unix_time() + decision.reset_after;
        at.as_secs() + u64::from(at.subsec_nanos() > 0)
    }

    fn check_local(
        &self,
        windows: &RwLock<HashMap<RateLimitKey, SharedCounter>>,
        key: &RateLimitKey,
        rule: LimitRule,
    ) -> Decision {
        let now = self.clock.now();
        let existing = windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        let counter = match existing {
            Some(counter) => counter,
            None => {
                let mut map = windows.write().unwrap_or_else(PoisonError::into_inner);
                map.entry(key.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(counter_for(
                            self.config.algorithm,
                            rule,
                            self.config.burst_size,
                            now,
                        )))
                    })
                    .clone()
            }
        };

        let mut guard = counter.lock().unwrap_or_else(PoisonError::into_inner);
        guard.admit(now)
    }

    async fn check_distributed(
        &self,
        ctx: &Context,
        kv: &dyn KvStore,
        incr_supported: &AtomicBool,
        key: &RateLimitKey,
        rule: LimitRule,
    ) -> Decision {
        let now = self.clock.unix_time();
        let window_secs = rule.window.as_secs().max(1);
        let window_start = now.as_secs() / window_secs * window_secs;
        let window_end = Duration::from_secs(window_start + window_secs);
        let reset = window_end.saturating_sub(now);
        let kv_key = format!("rate_limit:{key}:{window_start}");

        let counted = if incr_supported.load(Ordering::Relaxed) {
            match incr_window(ctx, kv, &kv_key, rule.window).await {
                Err(KvError::Unsupported(_)) => {
                    incr_supported.store(false, Ordering::Relaxed);
                    debug!("kv store has no atomic incr, using get/set");
                    get_set_window(ctx, kv, &kv_key, rule).await
                }
                other => other,
            }
        } else {
            get_set_window(ctx, kv, &kv_key, rule).await
        };

        match counted {
            Ok(count) if count <= rule.limit => {
                Decision::allow(rule.limit, rule.limit - count, reset)
            }
            Ok(_) => Decision::deny(rule.limit, reset),
            Err(err) => {
                self.counters.kv_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "kv store error during rate limit check, failing open");
                Decision::allow(rule.limit, rule.limit.saturating_sub(1), reset)
            }
        }
    }

    /// Drop local windows idle for more than twice the cleanup interval.
    pub fn sweep(&self) -> usize {
        let Backend::Local { windows } = &self.backend else {
            return 0;
        };
        let now = self.clock.now();
        let idle_after = self.config.cleanup_interval * 2;

        let mut map = windows.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, counter| {
            let counter = counter.lock().unwrap_or_else(PoisonError::into_inner);
            now.saturating_duration_since(counter.last_used()) <= idle_after
        });
        before - map.len()
    }

    pub fn tracked_keys(&self) -> usize {
        match &self.backend {
            Backend::Local { windows } => windows.read().unwrap_or_else(PoisonError::into_inner).len(),
            Backend::Distributed { .. } => 0,
        }
    }

    /// Sweep idle windows every `cleanup_interval` until `shutdown` fires.
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let mut ticker = self.clock.ticker(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.tracked_keys(), "swept idle rate limit windows");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("rate limiter sweeper shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move { limiter.run_sweeper(shutdown).await })
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            algorithm: self.config.algorithm,
            distributed: self.is_distributed(),
            tracked_keys: self.tracked_keys(),
            checks: self.counters.checks.load(Ordering::Relaxed),
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            kv_errors: self.counters.kv_errors.load(Ordering::Relaxed),
        }
    }
}

impl Observable for RateLimiter {
    fn observe(&self) -> Vec<ComponentMetrics> {
        let stats = self.stats();
        let metrics = ComponentMetrics::new(
            "rate_limiter",
            stats.algorithm.as_str(),
            self.clock.unix_time().as_secs(),
        )
        .gauge("distributed", if stats.distributed { 1.0 } else { 0.0 })
        .gauge("tracked_keys", stats.tracked_keys as f64)
        .gauge("checks", stats.checks as f64)
        .gauge("allowed", stats.allowed as f64)
        .gauge("denied", stats.denied as f64)
        .gauge("kv_errors", stats.kv_errors as f64);
        vec![metrics]
    }
}

/// Atomic path: the count after this request. Once `incr` has counted the
/// request, a failed `expire` is logged and the count still stands.
async fn incr_window(ctx: &Context, kv: &dyn KvStore, key: &str, window: Duration) -> KvResult<u64> {
    let count = kv.incr(ctx, key).await?;
    if count == 1 {
        if let Err(err) = kv.expire(ctx, key, window).await {
            warn!(kv_key = key, error = %err, "failed to set ttl on rate limit window");
        }
    }
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Read-modify-write path. Concurrent callers may over-count; a window at
/// its limit is never written again.
async fn get_set_window(ctx: &Context, kv: &dyn KvStore, key: &str, rule: LimitRule) -> KvResult<u64> {
    let current = match kv.get(ctx, key).await? {
        Some(raw) => raw.trim().parse::<u64>().map_err(|_| KvError::NotAnInteger {
            key: key.to_string(),
            value: raw.clone(),
        })?,
        None => 0,
    };
    let next = current + 1;
    if current < rule.limit {
        kv.set(ctx, key, next.to_string(), Some(rule.window)).await?;
    }
    Ok(next)
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the peer address.
fn client_ip(req: &Request) -> Option<String> {
    let headers = req.headers();
    if let Some(first) = headers
        .get("X-Forwarded-For")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(first.to_string());
    }
    if let Some(real) = headers.get("X-Real-IP").map(str::trim).filter(|ip| !ip.is_empty()) {
        return Some(real.to_string());
    }
    req.remote_addr().map(|addr| match addr.parse::<SocketAddr>() {
        Ok(sock) => sock.ip().to_string(),
        Err(_) => addr.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulwark_core::{ManualClock, MemoryKvStore};

    fn limiter(limit: u64, window: Duration) -> (ManualClock, RateLimiter) {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            default_limit: limit,
            default_window: window,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, clock.shared()).unwrap();
        (clock, limiter)
    }

    #[test]
    fn resolves_keys_in_order() {
        let (_clock, limiter) = limiter(10, Duration::from_secs(1));
        let req = Request::get("/orders?id=7")
            .with_header("X-Forwarded-For", "203.0.113.9, 10.0.0.1")
            .with_header("X-User-ID", "alice")
            .with_remote_addr("10.0.0.1:4000");

        let keys = limiter.keys_for(&req);
        assert_eq!(
            keys,
            vec![
                RateLimitKey::global(),
                RateLimitKey::ip("203.0.113.9", "/orders"),
                RateLimitKey::user("alice", "/orders"),
                RateLimitKey::endpoint("/orders"),
            ]
        );
    }

    #[test]
    fn client_ip_prefers_headers_then_peer() {
        let real = Request::get("/").with_header("X-Real-IP", "198.51.100.2").with_remote_addr("10.0.0.1:1");
        assert_eq!(client_ip(&real).as_deref(), Some("198.51.100.2"));

        let peer = Request::get("/").with_remote_addr("10.0.0.1:4000");
        assert_eq!(client_ip(&peer).as_deref(), Some("10.0.0.1"));

        assert_eq!(client_ip(&Request::get("/")), None);
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_counters() {
        let (_clock, limiter) = limiter(1, Duration::from_secs(1));
        let ctx = Context::background();
        assert!(limiter.check(&ctx, &RateLimitKey::ip("a", "/")).await.allowed);
        assert!(!limiter.check(&ctx, &RateLimitKey::ip("a", "/")).await.allowed);
        assert!(limiter.check(&ctx, &RateLimitKey::ip("b", "/")).await.allowed);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[tokio::test]
    async fn acquire_reports_exceeded() {
        let (_clock, limiter) = limiter(1, Duration::from_secs(2));
        let ctx = Context::background();
        let key = RateLimitKey::user("u", "/");
        limiter.acquire(&ctx, &key).await.unwrap();
        match limiter.acquire(&ctx, &key).await {
            Err(RateLimitError::Exceeded { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(2));
            }
            other => panic!("expected Exceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sweep_drops_idle_windows() {
        let (clock, limiter) = limiter(5, Duration::from_secs(1));
        let ctx = Context::background();
        limiter.check(&ctx, &RateLimitKey::ip("old", "/")).await;
        clock.advance(Duration::from_secs(90));
        limiter.check(&ctx, &RateLimitKey::ip("fresh", "/")).await;

        // Idle threshold is twice the default 60s cleanup interval.
        assert_eq!(limiter.sweep(), 0);
        clock.advance(Duration::from_secs(31));
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let (_clock, limiter) = limiter(5, Duration::from_secs(1));
        let limiter = Arc::new(limiter);
        let shutdown = CancellationToken::new();
        let handle = limiter.spawn_sweeper(shutdown.clone());
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn distributed_counts_per_window() {
        let clock = ManualClock::new();
        let kv = Arc::new(MemoryKvStore::new(clock.shared()));
        let config = RateLimitConfig {
            distributed: true,
            default_limit: 2,
            default_window: Duration::from_secs(10),
            ..Default::default()
        };
        let limiter = RateLimiter::with_kv_store(config, clock.shared(), kv.clone()).unwrap();
        assert!(limiter.is_distributed());

        let ctx = Context::background();
        let key = RateLimitKey::ip("10.0.0.1", "/a");
        assert_eq!(limiter.check(&ctx, &key).await.remaining, 1);
        assert_eq!(limiter.check(&ctx, &key).await.remaining, 0);

        let denied = limiter.check(&ctx, &key).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after <= Duration::from_secs(10));

        // ManualClock starts on a 10s boundary, so 10s later is a new window.
        clock.advance(Duration::from_secs(10));
        assert!(limiter.check(&ctx, &key).await.allowed);

        let window_start = ManualClock::UNIX_ORIGIN_SECS + 10;
        let stored = kv
            .get(&ctx, &format!("rate_limit:ip:10.0.0.1:/a:{window_start}"))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("1"));
    }

    /// Counts atomically but cannot set a ttl.
    #[derive(Debug)]
    struct NoExpireStore(MemoryKvStore);

    #[async_trait::async_trait]
    impl KvStore for NoExpireStore {
        async fn get(&self, ctx: &Context, key: &str) -> KvResult<Option<String>> {
            self.0.get(ctx, key).await
        }

        async fn set(&self, ctx: &Context, key: &str, value: String, ttl: Option<Duration>) -> KvResult<()> {
            self.0.set(ctx, key, value, ttl).await
        }

        async fn incr(&self, ctx: &Context, key: &str) -> KvResult<i64> {
            self.0.incr(ctx, key).await
        }

        async fn del(&self, ctx: &Context, keys: &[String]) -> KvResult<()> {
            self.0.del(ctx, keys).await
        }
    }

    #[tokio::test]
    async fn missing_expire_counts_each_request_once() {
        let clock = ManualClock::new();
        let kv = Arc::new(NoExpireStore(MemoryKvStore::new(clock.shared())));
        let config = RateLimitConfig {
            distributed: true,
            default_limit: 3,
            default_window: Duration::from_secs(10),
            ..Default::default()
        };
        let limiter = RateLimiter::with_kv_store(config, clock.shared(), kv.clone()).unwrap();

        let ctx = Context::background();
        let key = RateLimitKey::ip("10.0.0.1", "/a");
        assert_eq!(limiter.check(&ctx, &key).await.remaining, 2);
        assert_eq!(limiter.check(&ctx, &key).await.remaining, 1);
        assert_eq!(limiter.stats().kv_errors, 0);

        let window_start = ManualClock::UNIX_ORIGIN_SECS;
        let stored = kv
            .get(&ctx, &format!("rate_limit:ip:10.0.0.1:/a:{window_start}"))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn distributed_without_store_falls_back_to_local() {
        let clock = ManualClock::new();
        let config = RateLimitConfig {
            distributed: true,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config, clock.shared()).unwrap();
        assert!(!limiter.is_distributed());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RateLimitConfig {
            default_limit: 0,
            ..Default::default()
        };
        let result = RateLimiter::new(config, ManualClock::new().shared());
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[test]
    fn reset_header_rounds_up() {
        let (_clock, limiter) = limiter(1, Duration::from_secs(1));
        let decision = Decision::deny(1, Duration::from_millis(300));
        assert_eq!(limiter.reset_at_unix(&decision), ManualClock::UNIX_ORIGIN_SECS + 1);
    }
}
