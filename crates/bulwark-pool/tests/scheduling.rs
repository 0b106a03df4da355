//! Pool ordering, scaling and shutdown scenarios on paused tokio time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bulwark_core::{system_clock, Context};
use bulwark_pool::{job_fn, Job, JobHandler, JobResult, PoolConfig, PoolError, WorkerPool};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Sleeps for `payload.sleep_ms` and returns the job id.
fn sleeper() -> Arc<dyn JobHandler> {
    job_fn(|_ctx, job: Job| async move {
        let ms = job.payload["sleep_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Value::String(job.id))
    })
}

fn sleep_job(id: &str, priority: i32, ms: u64) -> Job {
    Job::new(id, "sleep")
        .with_priority(priority)
        .with_payload(json!({ "sleep_ms": ms }))
}

async fn collect(results: &mut mpsc::Receiver<JobResult>, n: usize) -> Vec<JobResult> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(results.recv().await.expect("result"));
    }
    out
}

fn single_worker() -> PoolConfig {
    PoolConfig {
        min_workers: 1,
        max_workers: 1,
        queue_size: 10,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn blocked_worker_then_runs_highest_priority_first() {
    let pool = WorkerPool::new("s3", single_worker(), sleeper(), system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();
    let ctx = Context::background();

    pool.submit(&ctx, sleep_job("blocker", 0, 200)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.busy_workers(), 1);

    for (id, p) in [("p1", 1), ("p5", 5), ("p3", 3)] {
        pool.submit(&ctx, sleep_job(id, p, 0)).unwrap();
    }
    let order: Vec<String> = collect(&mut results, 4)
        .await
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(order, vec!["blocker", "p5", "p3", "p1"]);
    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn equal_priorities_complete_in_submission_order() {
    let pool = WorkerPool::new("fifo", single_worker(), sleeper(), system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();
    let ctx = Context::background();

    pool.submit(&ctx, sleep_job("blocker", 0, 100)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    for (id, p) in [("1", 1), ("2", 2), ("3", 1)] {
        pool.submit(&ctx, sleep_job(id, p, 0)).unwrap();
    }

    let order: Vec<String> = collect(&mut results, 4)
        .await
        .into_iter()
        .skip(1)
        .map(|r| r.job_id)
        .collect();
    assert_eq!(order, vec!["2", "1", "3"]);
    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_without_blocking() {
    let config = PoolConfig {
        queue_size: 2,
        ..single_worker()
    };
    let pool = WorkerPool::new("tiny", config, sleeper(), system_clock()).unwrap();
    pool.start().unwrap();
    let ctx = Context::background();

    pool.submit(&ctx, sleep_job("running", 0, 1_000)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.submit(&ctx, sleep_job("a", 0, 0)).unwrap();
    pool.submit(&ctx, sleep_job("b", 0, 0)).unwrap();

    let err = pool.submit(&ctx, sleep_job("c", 0, 0)).unwrap_err();
    assert!(matches!(err, PoolError::QueueFull { capacity: 2, .. }));
    assert_eq!(pool.metrics().total_jobs, 3);
    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scales_up_under_load_and_back_down_when_idle() {
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 3,
        queue_size: 10,
        scale_up_threshold: 0.5,
        scale_down_threshold: 0.1,
        scale_up_cooldown: Duration::from_secs(1),
        scale_down_cooldown: Duration::from_secs(5),
        health_check_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let pool = WorkerPool::new("elastic", config, sleeper(), system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();
    let ctx = Context::background();

    for i in 0..9 {
        pool.submit(&ctx, sleep_job(&i.to_string(), 0, 2_000)).unwrap();
    }
    assert_eq!(pool.worker_count(), 1);

    // Within scale_up_cooldown + health_check_interval.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(pool.worker_count() >= 2);

    let mut peak = pool.worker_count();
    let mut done = Vec::new();
    while done.len() < 9 {
        tokio::select! {
            Some(result) = results.recv() => done.push(result),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                peak = peak.max(pool.worker_count());
            }
        }
    }
    assert!(peak <= 3);
    // No busy worker was ever torn down mid-job.
    assert!(done.iter().all(|r| r.success));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(pool.worker_count(), 1);
    assert_eq!(pool.idle_workers(), 1);
    pool.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_finishes_in_flight_and_discards_pending() {
    let config = PoolConfig {
        min_workers: 2,
        max_workers: 2,
        queue_size: 10,
        ..Default::default()
    };
    let pool = WorkerPool::new("drain", config, sleeper(), system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();
    let ctx = Context::background();

    for i in 0..6 {
        pool.submit(&ctx, sleep_job(&i.to_string(), 0, 1_000)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.busy_workers(), 2);

    pool.stop().await.unwrap();
    let mut finished = Vec::new();
    while let Some(result) = results.recv().await {
        finished.push(result);
    }
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|r| r.success));

    let m = pool.metrics();
    assert_eq!(m.discarded_jobs, 4);
    assert_eq!(m.active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn stop_cancels_jobs_past_the_grace_period() {
    let config = PoolConfig {
        worker_timeout: Duration::from_millis(500),
        ..single_worker()
    };
    let stuck = job_fn(|_ctx, _job| async {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });
    let pool = WorkerPool::new("stuck", config, stuck, system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();

    pool.submit(&Context::background(), Job::new("forever", "hang"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let started = tokio::time::Instant::now();
    pool.stop().await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(500));
    assert!(waited < Duration::from_secs(1));

    // Nothing arrives after the channel closes.
    assert!(results.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn worker_stats_track_processed_jobs() {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let handler = job_fn(move |_ctx, job: Job| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(job.id.clone());
            Ok(Value::Null)
        }
    });
    let pool = WorkerPool::new("stats", single_worker(), handler, system_clock()).unwrap();
    let mut results = pool.take_results().unwrap();
    pool.start().unwrap();

    for i in 0..3 {
        pool.submit(&Context::background(), Job::new(i.to_string(), "noop"))
            .unwrap();
    }
    collect(&mut results, 3).await;

    let stats = pool.worker_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].jobs_processed, 3);
    assert_eq!(stats[0].errors, 0);
    assert_eq!(recorded.lock().unwrap().len(), 3);
    pool.stop().await.unwrap();
}
