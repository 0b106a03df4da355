//! Time source abstraction.
//!
//! Components read time, sleep and tick exclusively through a [`Clock`].
//! [`SystemClock`] is backed by tokio's timer (so `start_paused` tests work
//! too); [`ManualClock`] only moves when a test calls [`ManualClock::advance`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// A boxed sleep future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Injectable time source.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic timestamp.
    fn now(&self) -> Instant;

    /// Wall-clock time since the unix epoch.
    fn unix_time(&self) -> Duration;

    /// Completes once `duration` has elapsed on this clock.
    fn sleep(&self, duration: Duration) -> Sleep;

    /// Fires every `period`; the first tick lands one period from now.
    fn ticker(&self, period: Duration) -> Ticker;
}

/// Convenience constructor for the production clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Clock backed by the tokio timer and the OS wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn unix_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }

    fn ticker(&self, period: Duration) -> Ticker {
        // tokio panics on a zero period.
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Ticker {
            inner: TickerInner::System(interval),
        }
    }
}

/// Deterministic clock for tests.
///
/// Time starts at construction and only moves forward through
/// [`advance`](ManualClock::advance). Pending sleeps and tickers wake as soon
/// as the elapsed time reaches their target.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    origin: Instant,
    unix_origin: Duration,
    elapsed: watch::Sender<Duration>,
}

impl ManualClock {
    /// Wall-clock reading at construction (2023-11-14T22:13:20Z).
    pub const UNIX_ORIGIN_SECS: u64 = 1_700_000_000;

    pub fn new() -> Self {
        let (elapsed, _) = watch::channel(Duration::ZERO);
        Self {
            inner: Arc::new(ManualInner {
                origin: Instant::now(),
                unix_origin: Duration::from_secs(Self::UNIX_ORIGIN_SECS),
                elapsed,
            }),
        }
    }

    /// Move time forward, waking any sleeper whose target has been reached.
    pub fn advance(&self, by: Duration) {
        self.inner.elapsed.send_modify(|elapsed| *elapsed += by);
    }

    /// Total time advanced since construction.
    pub fn elapsed(&self) -> Duration {
        *self.inner.elapsed.borrow()
    }

    /// Handle usable wherever a [`SharedClock`] is expected.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }

    fn wait_until(&self, target: Duration) -> Sleep {
        let mut rx = self.inner.elapsed.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|elapsed| *elapsed >= target).await;
        })
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.inner.origin + self.elapsed()
    }

    fn unix_time(&self) -> Duration {
        self.inner.unix_origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        self.wait_until(self.elapsed() + duration)
    }

    fn ticker(&self, period: Duration) -> Ticker {
        Ticker {
            inner: TickerInner::Manual {
                clock: self.clone(),
                period,
                next: self.elapsed() + period,
            },
        }
    }
}

/// Periodic tick source created by [`Clock::ticker`].
#[derive(Debug)]
pub struct Ticker {
    inner: TickerInner,
}

#[derive(Debug)]
enum TickerInner {
    System(Interval),
    Manual {
        clock: ManualClock,
        period: Duration,
        next: Duration,
    },
}

impl Ticker {
    /// Wait for the next tick.
    pub async fn tick(&mut self) {
        match &mut self.inner {
            TickerInner::System(interval) => {
                interval.tick().await;
            }
            TickerInner::Manual {
                clock,
                period,
                next,
            } => {
                clock.wait_until(*next).await;
                // Missed ticks are delayed, not replayed in a burst.
                *next = clock.elapsed() + *period;
            }
        }
    }
}
