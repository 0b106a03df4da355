//! Shared key/value store contract.
//!
//! The distributed rate limiter is the only consumer. Production deployments
//! plug in a networked store; [`MemoryKvStore`] covers tests and single-node
//! setups.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;

use crate::clock::SharedClock;
use crate::context::Context;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),

    #[error("kv operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("value at {key:?} is not an integer: {value:?}")]
    NotAnInteger { key: String, value: String },

    #[error("kv operation cancelled")]
    Cancelled,
}

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync + fmt::Debug {
    /// `Ok(None)` when the key is absent or expired.
    async fn get(&self, ctx: &Context, key: &str) -> KvResult<Option<String>>;

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> KvResult<()>;

    /// Atomic increment; a missing key counts from zero.
    async fn incr(&self, _ctx: &Context, _key: &str) -> KvResult<i64> {
        Err(KvError::Unsupported("incr"))
    }

    async fn expire(&self, _ctx: &Context, _key: &str, _ttl: Duration) -> KvResult<()> {
        Err(KvError::Unsupported("expire"))
    }

    async fn del(&self, ctx: &Context, keys: &[String]) -> KvResult<()>;
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process store with TTL support, driven by an injected clock.
#[derive(Debug)]
pub struct MemoryKvStore {
    clock: SharedClock,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, entry| !is_expired(entry, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(ctx: &Context) -> KvResult<()> {
        if ctx.is_cancelled() {
            Err(KvError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn is_expired(entry: &Entry, now: Instant) -> bool {
    entry.expires_at.is_some_and(|at| now >= at)
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, ctx: &Context, key: &str) -> KvResult<Option<String>> {
        Self::check(ctx)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some(entry) if is_expired(entry, now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        ctx: &Context,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        Self::check(ctx)?;
        let expires_at = ttl.map(|ttl| self.clock.now() + ttl);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn incr(&self, ctx: &Context, key: &str) -> KvResult<i64> {
        Self::check(ctx)?;
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|entry| is_expired(entry, now)) {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry.value.parse().map_err(|_| KvError::NotAnInteger {
            key: key.to_string(),
            value: entry.value.clone(),
        })?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, ctx: &Context, key: &str, ttl: Duration) -> KvResult<()> {
        Self::check(ctx)?;
        let at = self.clock.now() + ttl;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(at);
        }
        Ok(())
    }

    async fn del(&self, ctx: &Context, keys: &[String]) -> KvResult<()> {
        Self::check(ctx)?;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}
