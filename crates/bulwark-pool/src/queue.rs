//! Bounded priority queue shared by the pool's workers.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::job::Job;

/// Heap entry: highest priority first, then lowest sequence number.
#[derive(Debug)]
struct Queued {
    seq: u64,
    job: Job,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.job
            .priority
            .cmp(&other.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct State {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
pub(crate) enum PushError {
    Full(Job),
    Closed(Job),
}

#[derive(Debug)]
pub(crate) struct JobQueue {
    capacity: usize,
    state: Mutex<State>,
    ready: Notify,
}

impl JobQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State::default()),
            ready: Notify::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueue without blocking; returns the depth after insertion.
    pub(crate) fn push(&self, job: Job) -> Result<usize, PushError> {
        let depth = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(PushError::Closed(job));
            }
            if state.heap.len() >= self.capacity {
                return Err(PushError::Full(job));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Queued { seq, job });
            state.heap.len()
        };
        self.ready.notify_one();
        Ok(depth)
    }

    pub(crate) fn pop(&self) -> Option<Job> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let job = state.heap.pop().map(|queued| queued.job);
        let more = !state.heap.is_empty();
        drop(state);
        // Pass the wakeup on so a coalesced permit cannot strand work.
        if job.is_some() && more {
            self.ready.notify_one();
        }
        job
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .heap
            .len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after a push (or a stored permit from an earlier one).
    pub(crate) async fn ready(&self) {
        self.ready.notified().await;
    }

    /// Hand a wakeup to another waiting worker.
    pub(crate) fn wake_one(&self) {
        self.ready.notify_one();
    }

    /// Refuse further pushes and return whatever was still pending.
    pub(crate) fn close(&self) -> Vec<Job> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        std::mem::take(&mut state.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|queued| queued.job)
            .collect()
    }
}
