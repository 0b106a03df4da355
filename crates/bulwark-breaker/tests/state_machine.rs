//! Breaker lifecycle scenarios driven on paused tokio time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use bulwark_breaker::{BreakerConfig, BreakerError, BreakerManager, BreakerState, CircuitBreaker};
use bulwark_core::{system_clock, Context};
use tokio_util::sync::CancellationToken;

fn s2_config() -> BreakerConfig {
    BreakerConfig {
        failure_threshold: 3,
        open_timeout: Duration::from_millis(500),
        success_threshold: 2,
        half_open_max_requests: 2,
        half_open_success_ratio: 1.0,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn open_half_open_close_cycle() {
    let breaker: CircuitBreaker<&'static str> =
        CircuitBreaker::new("inventory", s2_config(), system_clock()).unwrap();
    let ctx = Context::background();

    for _ in 0..3 {
        let result = breaker
            .execute(&ctx, |_ctx| async { Err(anyhow!("connection refused")) })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert_eq!(breaker.state(), BreakerState::Open);

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    let rejected = breaker
        .execute(&ctx, move |_ctx| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("unreachable")
        })
        .await;
    assert!(matches!(rejected, Err(BreakerError::Open)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(600)).await;
    for _ in 0..2 {
        assert_eq!(breaker.execute(&ctx, |_ctx| async { Ok("fresh") }).await.unwrap(), "fresh");
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test(start_paused = true)]
async fn at_most_max_probes_run_concurrently() {
    let config = BreakerConfig {
        failure_threshold: 1,
        success_threshold: 10,
        half_open_max_requests: 3,
        timeout_threshold: Duration::from_secs(60),
        ..s2_config()
    };
    let breaker = Arc::new(CircuitBreaker::<u32>::new("search", config, system_clock()).unwrap());
    breaker
        .execute(&Context::background(), |_ctx| async { Err(anyhow!("down")) })
        .await
        .unwrap_err();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut calls = Vec::new();
    for _ in 0..10 {
        let breaker = breaker.clone();
        let running = running.clone();
        let peak = peak.clone();
        calls.push(tokio::spawn(async move {
            breaker
                .execute(&Context::background(), move |_ctx| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
        }));
    }

    let mut limited = 0;
    for call in calls {
        if let Err(err) = call.await.unwrap() {
            assert!(matches!(err, BreakerError::HalfOpenLimitExceeded));
            limited += 1;
        }
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(limited, 7);
}

#[tokio::test(start_paused = true)]
async fn monitor_reopens_breaker_stuck_half_open() {
    let clock = system_clock();
    let manager: BreakerManager<u32> = BreakerManager::new(clock);
    let config = BreakerConfig {
        failure_threshold: 1,
        half_open_timeout: Duration::from_secs(3),
        monitoring_interval: Duration::from_secs(1),
        timeout_threshold: Duration::from_secs(60),
        ..s2_config()
    };
    let breaker = manager.get_or_create("ledger", &config).unwrap();
    let shutdown = CancellationToken::new();
    let monitors = manager.spawn_monitors(&shutdown);
    assert_eq!(monitors.len(), 1);

    breaker
        .execute(&Context::background(), |_ctx| async { Err(anyhow!("down")) })
        .await
        .unwrap_err();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let hung = {
        let breaker = breaker.clone();
        tokio::spawn(async move {
            breaker
                .execute(&Context::background(), |_ctx| async {
                    std::future::pending::<()>().await;
                    Ok(0)
                })
                .await
        })
    };
    tokio::task::yield_now().await;
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(breaker.state(), BreakerState::Open);

    shutdown.cancel();
    for monitor in monitors {
        monitor.await.unwrap();
    }
    hung.abort();
}

#[tokio::test(start_paused = true)]
async fn metrics_serialize_for_dashboards() {
    let breaker = CircuitBreaker::<u32>::new("profile", s2_config(), system_clock()).unwrap();
    breaker
        .execute(&Context::background(), |_ctx| async { Ok(1) })
        .await
        .unwrap();
    breaker
        .execute(&Context::background(), |_ctx| async { Err(anyhow!("bad")) })
        .await
        .unwrap_err();

    let json = serde_json::to_value(breaker.metrics()).unwrap();
    assert_eq!(json["state"], "closed");
    assert_eq!(json["requests"], 2);
    assert_eq!(json["failure_rate"], 0.5);
}
