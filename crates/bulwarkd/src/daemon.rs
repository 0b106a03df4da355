//! Component assembly and the ordered start/stop sequence.

use std::collections::BTreeMap;
use std::sync::Arc;

use bulwark_autoscale::{AutoScaler, ScalingExecutor};
use bulwark_breaker::{BreakerLayer, BreakerManager};
use bulwark_chaos::{ChaosLayer, FaultInjector};
use bulwark_core::SharedClock;
use bulwark_http::{Response, Stack};
use bulwark_metrics::MetricsCollector;
use bulwark_pool::{JobHandler, WorkerPool};
use bulwark_ratelimit::{RateLimitLayer, RateLimiter};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BulwarkConfig;

/// Breaker that guards the outbound handler in [`Daemon::http_stack`].
pub const UPSTREAM_BREAKER: &str = "upstream";

const POOL_NAME: &str = "default";

pub struct Daemon {
    config: BulwarkConfig,
    clock: SharedClock,
    pool: Arc<WorkerPool>,
    breakers: Arc<BreakerManager<Response>>,
    limiter: Arc<RateLimiter>,
    chaos: Arc<FaultInjector>,
    scaler: Arc<AutoScaler>,
    collector: Arc<MetricsCollector>,
}

impl Daemon {
    pub async fn build(
        config: BulwarkConfig,
        clock: SharedClock,
        handler: Arc<dyn JobHandler>,
        executor: Arc<dyn ScalingExecutor>,
    ) -> anyhow::Result<Self> {
        let pool = Arc::new(WorkerPool::new(POOL_NAME, config.pool.clone(), handler, clock.clone())?);

        let breakers = Arc::new(BreakerManager::new(clock.clone()));
        for (name, breaker) in &config.breakers {
            breakers.get_or_create(name, breaker)?;
        }

        let limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone(), clock.clone())?);
        let chaos = Arc::new(FaultInjector::new(config.chaos.clone(), clock.clone())?);
        let scaler = Arc::new(AutoScaler::new(config.autoscaler.clone(), clock.clone(), executor)?);

        let collector = Arc::new(MetricsCollector::new(config.metrics.clone(), clock.clone()));
        collector.register("pool", pool.clone()).await;
        collector.register("breakers", breakers.clone()).await;
        collector.register("rate_limiter", limiter.clone()).await;
        collector.register("chaos", chaos.clone()).await;
        collector.register("autoscaler", scaler.clone()).await;

        Ok(Self {
            config,
            clock,
            pool,
            breakers,
            limiter,
            chaos,
            scaler,
            collector,
        })
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<BreakerManager<Response>> {
        &self.breakers
    }

    pub fn chaos(&self) -> &Arc<FaultInjector> {
        &self.chaos
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    /// Interceptors for an embedding HTTP server, outermost first: rate
    /// limiting, chaos, then the upstream breaker when one is configured.
    pub fn http_stack(&self) -> Stack {
        let stack = Stack::new()
            .layer(Arc::new(RateLimitLayer::new(Arc::clone(&self.limiter))))
            .layer(Arc::new(ChaosLayer::new(Arc::clone(&self.chaos))));
        match self.breakers.get(UPSTREAM_BREAKER) {
            Some(breaker) => stack.layer(Arc::new(BreakerLayer::new(breaker))),
            None => stack,
        }
    }

    /// Feed pool load into the scaler: worker utilization stands in for CPU
    /// and queue fill for memory.
    pub fn report_load(&self) {
        let m = self.pool.metrics();
        let workers = if m.active_workers == 0 {
            0.0
        } else {
            m.busy_workers as f64 / m.active_workers as f64
        };
        let queue = m.queue_depth as f64 / m.queue_capacity.max(1) as f64;
        let custom = BTreeMap::from([("queue_depth".to_string(), m.queue_depth as f64)]);
        debug!(workers, queue, queue_depth = m.queue_depth, "reporting pool load");
        self.scaler.update_metrics(workers, queue, &custom);
    }

    /// Start everything, run until `shutdown`, then stop in order: scaler,
    /// chaos, background monitors, pool and finally the collector.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let components = CancellationToken::new();
        let collector_stop = CancellationToken::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        self.pool.start()?;
        if let Some(results) = self.pool.take_results() {
            handles.push(tokio::spawn(drain_results(results)));
        }
        handles.extend(self.breakers.spawn_monitors(&components));
        handles.push(self.limiter.spawn_sweeper(components.clone()));
        self.chaos.start()?;
        handles.push(self.chaos.spawn_monitor(components.clone()));
        handles.extend(self.scaler.start(&components)?);
        let collector = self.collector.spawn(collector_stop.clone());

        info!(
            pool_workers = self.config.pool.min_workers,
            breakers = self.breakers.len(),
            chaos = self.chaos.is_enabled(),
            autoscaler = self.config.autoscaler.enabled,
            "bulwark daemon running"
        );

        let mut ticker = self.clock.ticker(self.config.pool.metrics_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.report_load(),
                _ = shutdown.cancelled() => break,
            }
        }

        info!("bulwark daemon shutting down");
        self.scaler.stop();
        self.chaos.stop();
        components.cancel();
        if let Err(err) = self.pool.stop().await {
            warn!(error = %err, "worker pool did not stop cleanly");
        }
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        collector_stop.cancel();
        if let Err(err) = collector.await {
            warn!(error = %err, "metrics collector ended abnormally");
        }

        info!("bulwark daemon stopped");
        Ok(())
    }
}

async fn drain_results(mut results: tokio::sync::mpsc::Receiver<bulwark_pool::JobResult>) {
    while let Some(result) = results.recv().await {
        if result.success {
            debug!(job_id = %result.job_id, attempts = result.attempts, duration = ?result.duration, "job completed");
        } else {
            warn!(
                job_id = %result.job_id,
                attempts = result.attempts,
                error = result.error.as_deref().unwrap_or_default(),
                "job failed"
            );
        }
    }
}
