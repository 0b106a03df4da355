//! Host-level stressors behind the `memory` and `cpu` fault types.

use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_core::{Clock, Context};
use serde::Serialize;
use tracing::{info, warn};

/// How a stress run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StressOutcome {
    /// Safe mode is on; nothing was allocated or spun.
    Skipped,
    Completed,
    /// The caller's context ended before the hold elapsed.
    Cancelled,
    AllocationFailed,
}

/// Wait out `hold` unless the context finishes first.
async fn hold_for(clock: &dyn Clock, ctx: &Context, hold: Duration) -> StressOutcome {
    tokio::select! {
        _ = clock.sleep(hold) => StressOutcome::Completed,
        _ = ctx.done(clock) => StressOutcome::Cancelled,
    }
}

pub(crate) async fn memory_pressure(
    clock: &dyn Clock,
    ctx: &Context,
    bytes: u64,
    hold: Duration,
) -> StressOutcome {
    let Ok(len) = usize::try_from(bytes) else {
        warn!(size_bytes = bytes, "memory pressure size does not fit this platform");
        return StressOutcome::AllocationFailed;
    };
    let mut ballast: Vec<u8> = Vec::new();
    if let Err(err) = ballast.try_reserve_exact(len) {
        warn!(size_bytes = bytes, error = %err, "memory pressure allocation failed");
        return StressOutcome::AllocationFailed;
    }
    // Writing every byte commits the pages.
    ballast.resize(len, 0xA5);
    info!(size_bytes = bytes, hold = ?hold, "injecting memory pressure");

    let outcome = hold_for(clock, ctx, hold).await;
    drop(black_box(ballast));
    info!(outcome = ?outcome, "memory pressure released");
    outcome
}

pub(crate) async fn cpu_stress(
    clock: &dyn Clock,
    ctx: &Context,
    workers: usize,
    hold: Duration,
) -> StressOutcome {
    info!(workers, hold = ?hold, "injecting cpu stress");
    let stop = Arc::new(AtomicBool::new(false));
    let spinners: Vec<_> = (0..workers.max(1))
        .map(|_| {
            let stop = Arc::clone(&stop);
            tokio::task::spawn_blocking(move || {
                let mut acc = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    for i in 0..100_000u64 {
                        acc = black_box(acc.wrapping_add(i.wrapping_mul(i)));
                    }
                }
                acc
            })
        })
        .collect();

    let outcome = hold_for(clock, ctx, hold).await;
    stop.store(true, Ordering::Relaxed);
    for spinner in spinners {
        let _ = spinner.await;
    }
    info!(outcome = ?outcome, "cpu stress finished");
    outcome
}
