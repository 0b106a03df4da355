//! Metrics collector — periodically reads every registered component.
//!
//! Sources are anything implementing [`Observable`]. Each collection calls
//! every source once, keeps the combined result as the latest snapshot and
//! optionally logs it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bulwark_core::{ComponentMetrics, Observable, SharedClock};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MetricsConfig;

/// One collection across all sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    pub collected_at_unix: u64,
    /// Source name → what it reported.
    pub sources: BTreeMap<String, Vec<ComponentMetrics>>,
}

impl Snapshot {
    /// Every component entry of the given kind, across sources.
    pub fn component(&self, component: &str) -> Vec<&ComponentMetrics> {
        self.sources
            .values()
            .flatten()
            .filter(|m| m.component == component)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct MetricsCollector {
    config: MetricsConfig,
    clock: SharedClock,
    /// Source name → source.
    sources: RwLock<BTreeMap<String, Arc<dyn Observable>>>,
    latest: RwLock<Snapshot>,
    collections: AtomicU64,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            sources: RwLock::new(BTreeMap::new()),
            latest: RwLock::new(Snapshot::default()),
            collections: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// Register a source, replacing any previous one with the same name.
    pub async fn register(&self, name: &str, source: Arc<dyn Observable>) {
        self.sources.write().await.insert(name.to_string(), source);
        debug!(source = %name, "registered for metrics collection");
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.sources.write().await.remove(name).is_some();
        if removed {
            debug!(source = %name, "unregistered from metrics collection");
        }
        removed
    }

    pub async fn source_names(&self) -> Vec<String> {
        self.sources.read().await.keys().cloned().collect()
    }

    /// Read every source now and store the result as the latest snapshot.
    pub async fn collect(&self) -> Snapshot {
        let snapshot = {
            let sources = self.sources.read().await;
            Snapshot {
                collected_at_unix: self.clock.unix_time().as_secs(),
                sources: sources
                    .iter()
                    .map(|(name, source)| (name.clone(), source.observe()))
                    .collect(),
            }
        };

        if self.config.log_snapshots {
            for (source, entries) in &snapshot.sources {
                for m in entries {
                    info!(
                        source = %source,
                        component = %m.component,
                        name = %m.name,
                        gauges = ?m.gauges,
                        "component metrics"
                    );
                }
            }
        }
        let count = self.collections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            sources = snapshot.sources.len(),
            entries = snapshot.len(),
            collection = count,
            "metrics collected"
        );

        *self.latest.write().await = snapshot.clone();
        snapshot
    }

    /// The most recent collection; empty before the first one.
    pub async fn latest(&self) -> Snapshot {
        self.latest.read().await.clone()
    }

    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    /// Collect every `interval` until shutdown, with a final collection on
    /// the way out.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.config.interval, "metrics collector started");
        let mut ticker = self.clock.ticker(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect().await;
                }
                _ = shutdown.cancelled() => {
                    info!("metrics collector shutting down");
                    self.collect().await;
                    break;
                }
            }
        }
    }

    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move { collector.run(shutdown).await })
    }
}
