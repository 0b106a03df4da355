//! Admission counters.
//!
//! Each counter is plain data driven by an explicit `now`; the limiter owns
//! locking and the clock. All three algorithms answer the same
//! [`Counter::admit`] call so config can swap them freely.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{Algorithm, LimitRule};

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Wait before a retry can succeed; zero when allowed.
    pub retry_after: Duration,
    /// Time until capacity is next restored.
    pub reset_after: Duration,
}

impl Decision {
    pub fn allow(limit: u64, remaining: u64, reset_after: Duration) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: Duration::ZERO,
            reset_after,
        }
    }

    pub fn deny(limit: u64, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after,
            reset_after: retry_after,
        }
    }

    /// `Retry-After` value: whole seconds rounded up, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.retry_after.as_millis();
        let secs = millis.div_ceil(1000).max(1);
        u64::try_from(secs).unwrap_or(u64::MAX)
    }
}

pub trait Counter: Send + fmt::Debug {
    fn admit(&mut self, now: Instant) -> Decision;

    /// Last admission attempt, or creation time.
    fn last_used(&self) -> Instant;
}

/// Build the counter for `algorithm`. `burst` only affects the token bucket.
pub fn counter_for(algorithm: Algorithm, rule: LimitRule, burst: u64, now: Instant) -> Box<dyn Counter> {
    match algorithm {
        Algorithm::SlidingWindow => Box::new(SlidingWindow::new(rule.limit, rule.window, now)),
        Algorithm::FixedWindow => Box::new(FixedWindow::new(rule.limit, rule.window, now)),
        Algorithm::TokenBucket => Box::new(TokenBucket::new(rule.limit, rule.window, burst, now)),
    }
}

/// Exact trailing-window log of admitted events.
///
/// After every call, retained timestamps lie within `(now - window, now]`.
#[derive(Debug)]
pub struct SlidingWindow {
    limit: u64,
    window: Duration,
    events: VecDeque<Instant>,
    last_used: Instant,
}

impl SlidingWindow {
    pub fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            events: VecDeque::new(),
            last_used: now,
        }
    }

    /// Events currently inside the window.
    pub fn occupancy(&self) -> usize {
        self.events.len()
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.events.front().is_some_and(|&t| t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn until_oldest_expires(&self, now: Instant) -> Duration {
        self.events
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }
}

impl Counter for SlidingWindow {
    fn admit(&mut self, now: Instant) -> Decision {
        self.evict(now);
        self.last_used = now;

        let count = self.events.len() as u64;
        if count < self.limit {
            self.events.push_back(now);
            let reset = self.until_oldest_expires(now);
            Decision::allow(self.limit, self.limit - count - 1, reset)
        } else {
            Decision::deny(self.limit, self.until_oldest_expires(now))
        }
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }
}

/// Counter reset at fixed boundaries aligned to the first use.
#[derive(Debug)]
pub struct FixedWindow {
    limit: u64,
    window: Duration,
    window_start: Instant,
    count: u64,
    last_used: Instant,
}

impl FixedWindow {
    pub fn new(limit: u64, window: Duration, now: Instant) -> Self {
        Self {
            limit,
            window,
            window_start: now,
            count: 0,
            last_used: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return;
        }
        let window_nanos = self.window.as_nanos().max(1);
        let skipped = elapsed.as_nanos() - elapsed.as_nanos() % window_nanos;
        self.window_start += Duration::from_nanos(u64::try_from(skipped).unwrap_or(u64::MAX));
        self.count = 0;
    }
}

impl Counter for FixedWindow {
    fn admit(&mut self, now: Instant) -> Decision {
        self.roll(now);
        self.last_used = now;

        let reset = (self.window_start + self.window).saturating_duration_since(now);
        if self.count < self.limit {
            self.count += 1;
            Decision::allow(self.limit, self.limit - self.count, reset)
        } else {
            Decision::deny(self.limit, reset)
        }
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }
}

/// Refills `limit` tokens per `window`, holding at most `burst` (or `limit`).
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl TokenBucket {
    pub fn new(limit: u64, window: Duration, burst: u64, now: Instant) -> Self {
        let capacity = if burst > 0 { burst } else { limit } as f64;
        let refill_per_sec = limit as f64 / window.as_secs_f64().max(f64::EPSILON);
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: now,
            last_used: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn secs_for(&self, tokens: f64) -> Duration {
        Duration::from_secs_f64((tokens / self.refill_per_sec).max(0.0))
    }
}

impl Counter for TokenBucket {
    fn admit(&mut self, now: Instant) -> Decision {
        self.refill(now);
        self.last_used = now;

        let limit = self.capacity as u64;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let reset = self.secs_for(self.capacity - self.tokens);
            Decision::allow(limit, self.tokens.floor() as u64, reset)
        } else {
            Decision::deny(limit, self.secs_for(1.0 - self.tokens))
        }
    }

    fn last_used(&self) -> Instant {
        self.last_used
    }
}
