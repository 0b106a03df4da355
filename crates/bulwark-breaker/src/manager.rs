//! Named breaker registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use bulwark_core::{ComponentMetrics, Observable, SharedClock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::config::BreakerConfig;
use crate::error::BreakerResult;

/// Owns one breaker per dependency name.
///
/// Breakers are created lazily on first lookup; a name keeps the config it
/// was created with for its whole life.
pub struct BreakerManager<T> {
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker<T>>>>,
}

impl<T: Send + 'static> BreakerManager<T> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the breaker for `name`, creating it with `config` if absent.
    pub fn get_or_create(&self, name: &str, config: &BreakerConfig) -> BreakerResult<Arc<CircuitBreaker<T>>> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have won the race between the two locks.
        if let Some(existing) = breakers.get(name) {
            return Ok(Arc::clone(existing));
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config.clone(), self.clock.clone())?);
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        debug!(breaker = name, "created circuit breaker");
        Ok(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker<T>>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker<T>>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn metrics(&self) -> BTreeMap<String, BreakerMetrics> {
        self.snapshot()
            .into_iter()
            .map(|b| (b.name().to_string(), b.metrics()))
            .collect()
    }

    pub fn reset_all(&self) {
        let breakers = self.snapshot();
        for breaker in &breakers {
            breaker.reset();
        }
        info!(count = breakers.len(), "reset all circuit breakers");
    }

    /// Start a monitor task for every breaker registered so far.
    pub fn spawn_monitors(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.snapshot()
            .iter()
            .map(|b| b.spawn_monitor(shutdown.clone()))
            .collect()
    }
}

impl<T: Send + 'static> Observable for BreakerManager<T> {
    fn observe(&self) -> Vec<ComponentMetrics> {
        let now = self.clock.unix_time().as_secs();
        self.metrics()
            .values()
            .map(|m| m.to_component(now))
            .collect()
    }
}
