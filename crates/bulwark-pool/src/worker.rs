use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Busy = 1,
    Draining = 2,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Busy,
            _ => Self::Draining,
        }
    }
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    pub id: u64,
    pub state: WorkerState,
    pub jobs_processed: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
    pub idle_for_ms: u64,
}

/// Pool-side record of a worker task.
///
/// Times are nanoseconds since the pool's origin instant. The worker task
/// only receives this slot and its quit token, never the pool itself.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) id: u64,
    state: AtomicU8,
    last_used: AtomicU64,
    /// Timeout of the job in hand, zero when unbounded or idle.
    current_timeout: AtomicU64,
    jobs_processed: AtomicU64,
    errors: AtomicU64,
    total_duration: AtomicU64,
    pub(crate) quit: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSlot {
    pub(crate) fn new(id: u64, now: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle as u8),
            last_used: AtomicU64::new(now),
            current_timeout: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_duration: AtomicU64::new(0),
            quit: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn swap_state(&self, from: WorkerState, to: WorkerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle → busy. Fails once the worker has been told to drain.
    pub(crate) fn claim(&self) -> bool {
        self.swap_state(WorkerState::Idle, WorkerState::Busy)
    }

    /// Undo a claim that found the queue empty.
    pub(crate) fn unclaim(&self) {
        self.swap_state(WorkerState::Busy, WorkerState::Idle);
    }

    /// Busy → idle, stamping `last_used`.
    pub(crate) fn release(&self, now: u64) {
        self.current_timeout.store(0, Ordering::Release);
        self.last_used.store(now, Ordering::Release);
        self.swap_state(WorkerState::Busy, WorkerState::Idle);
    }

    /// Idle → draining. Busy workers are never drained.
    pub(crate) fn drain(&self) -> bool {
        if self.swap_state(WorkerState::Idle, WorkerState::Draining) {
            self.quit.cancel();
            return true;
        }
        false
    }

    pub(crate) fn mark_draining(&self) {
        self.state.store(WorkerState::Draining as u8, Ordering::Release);
    }

    pub(crate) fn begin_job(&self, now: u64, timeout: Option<Duration>) {
        self.last_used.store(now, Ordering::Release);
        let nanos = timeout.map_or(0, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX));
        self.current_timeout.store(nanos, Ordering::Release);
    }

    pub(crate) fn current_timeout(&self) -> Option<Duration> {
        match self.current_timeout.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    pub(crate) fn record(&self, duration: Duration, failed: bool) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.total_duration.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self, now: u64) -> Duration {
        Duration::from_nanos(now.saturating_sub(self.last_used.load(Ordering::Acquire)))
    }

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn stats(&self, now: u64) -> WorkerStats {
        let state = self.state();
        let idle_for = match state {
            WorkerState::Busy => Duration::ZERO,
            _ => self.idle_for(now),
        };
        WorkerStats {
            id: self.id,
            state,
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_duration_ms: Duration::from_nanos(self.total_duration.load(Ordering::Relaxed)).as_millis() as u64,
            idle_for_ms: idle_for.as_millis() as u64,
        }
    }
}
