//! Auto-scaler behaviour across evaluation rounds.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bulwark_autoscale::{
    ActionType, AutoScaler, AutoScalerConfig, CustomMetric, ScalingAction, ScalingExecutor,
};
use bulwark_core::{system_clock, Context, ManualClock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Remembers every action it was asked to apply and when.
#[derive(Default)]
struct Recording {
    applied: Mutex<Vec<(Instant, ScalingAction)>>,
}

impl Recording {
    fn applied(&self) -> Vec<(Instant, ScalingAction)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScalingExecutor for Recording {
    async fn apply(&self, _ctx: &Context, action: &ScalingAction) -> anyhow::Result<()> {
        self.applied.lock().unwrap().push((Instant::now(), action.clone()));
        Ok(())
    }
}

fn no_custom() -> BTreeMap<String, f64> {
    BTreeMap::new()
}

#[tokio::test]
async fn hot_cpu_scales_up_once_per_cooldown() {
    let clock = ManualClock::new();
    let recording = Arc::new(Recording::default());
    let config = AutoScalerConfig {
        min_replicas: 2,
        max_replicas: 10,
        target_cpu_utilization: 0.5,
        predictive_scaling: false,
        ..Default::default()
    };
    let scaler = AutoScaler::new(config, clock.shared(), recording.clone()).unwrap();
    clock.advance(Duration::from_secs(121));

    let mut emitted = Vec::new();
    for _ in 0..3 {
        scaler.update_metrics(1.0, 0.0, &no_custom());
        emitted.extend(scaler.evaluate());
    }
    let first = &emitted[0];
    assert_eq!(first.action, ActionType::ScaleUp);
    assert_eq!(first.from_replicas, 2);
    assert!(first.target_replicas >= 4);

    // Later rounds repeat the same target; only one reaches the executor.
    scaler.apply_pending().await;
    assert_eq!(recording.applied().len(), 1);
    assert_eq!(scaler.current_replicas(), 4);

    scaler.update_metrics(1.0, 0.0, &no_custom());
    assert!(scaler.evaluate().is_none(), "scale-up cooldown must hold");
}

#[tokio::test]
async fn targets_stay_within_bounds() {
    let readings = [
        0.0,
        0.001,
        0.3,
        0.7,
        1.0,
        3.5,
        1e9,
        f64::INFINITY,
        f64::NAN,
        -1.0,
    ];
    for (min, max) in [(1, 1), (1, 3), (2, 10), (5, 50)] {
        let clock = ManualClock::new();
        let mut config = AutoScalerConfig {
            min_replicas: min,
            max_replicas: max,
            scale_up_cooldown: Duration::ZERO,
            scale_down_cooldown: Duration::ZERO,
            predictive_scaling: true,
            ..Default::default()
        };
        config.custom_metrics.insert(
            "backlog".into(),
            CustomMetric {
                target_value: 10.0,
                weight: 2.0,
                ..Default::default()
            },
        );
        let scaler = AutoScaler::new(config, clock.shared(), Arc::new(Recording::default())).unwrap();

        for cpu in readings {
            for memory in readings {
                let custom = BTreeMap::from([("backlog".to_string(), cpu * 40.0)]);
                scaler.update_metrics(cpu, memory, &custom);
                let desired = scaler.recommend().desired;
                assert!((min..=max).contains(&desired), "{desired} outside [{min}, {max}]");
                if let Some(action) = scaler.evaluate() {
                    assert!((min..=max).contains(&action.target_replicas));
                }
                scaler.apply_pending().await;
                assert!((min..=max).contains(&scaler.current_replicas()));
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn same_direction_actions_respect_cooldowns() {
    let recording = Arc::new(Recording::default());
    let up = Duration::from_secs(60);
    let down = Duration::from_secs(120);
    let config = AutoScalerConfig {
        min_replicas: 2,
        max_replicas: 50,
        target_cpu_utilization: 0.5,
        scale_up_cooldown: up,
        scale_down_cooldown: down,
        evaluation_interval: Duration::from_secs(10),
        predictive_scaling: false,
        ..Default::default()
    };
    let scaler = Arc::new(AutoScaler::new(config, system_clock(), recording.clone()).unwrap());
    let shutdown = CancellationToken::new();
    let handles = scaler.start(&shutdown).unwrap();
    assert!(scaler.start(&shutdown).is_err());

    // Five hot minutes, then ten cold ones, reported every 5s.
    for step in 0..180 {
        let cpu = if step < 60 { 1.0 } else { 0.1 };
        scaler.update_metrics(cpu, 0.0, &no_custom());
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    scaler.stop();
    for handle in handles {
        handle.await.unwrap();
    }

    let applied = recording.applied();
    let ups: Vec<Instant> = applied
        .iter()
        .filter(|(_, a)| a.action == ActionType::ScaleUp)
        .map(|(at, _)| *at)
        .collect();
    let downs: Vec<Instant> = applied
        .iter()
        .filter(|(_, a)| a.action == ActionType::ScaleDown)
        .map(|(at, _)| *at)
        .collect();
    assert!(ups.len() >= 2, "expected repeated scale-ups, got {ups:?}");
    assert!(!downs.is_empty());
    for pair in ups.windows(2) {
        assert!(pair[1] - pair[0] >= up);
    }
    for pair in downs.windows(2) {
        assert!(pair[1] - pair[0] >= down);
    }
    assert_eq!(scaler.current_replicas(), 2);

    let metrics = scaler.metrics();
    assert_eq!(metrics.scale_up_count as usize, ups.len());
    assert_eq!(metrics.scale_down_count as usize, downs.len());
}

#[tokio::test]
async fn disabled_scaler_spawns_nothing() {
    let config = AutoScalerConfig {
        enabled: false,
        ..Default::default()
    };
    let scaler = Arc::new(AutoScaler::new(config, system_clock(), Arc::new(Recording::default())).unwrap());
    let handles = scaler.start(&CancellationToken::new()).unwrap();
    assert!(handles.is_empty());
    assert!(!scaler.is_running());
}

#[test]
fn metrics_serialize_for_the_collector() {
    let clock = ManualClock::new();
    let scaler = AutoScaler::new(AutoScalerConfig::default(), clock.shared(), Arc::new(Recording::default())).unwrap();
    scaler.update_metrics(0.42, 0.3, &no_custom());
    let json = serde_json::to_value(scaler.metrics()).unwrap();
    assert_eq!(json["current_replicas"], 2);
    assert_eq!(json["cpu_utilization"], 0.42);
    assert!(json["recent_events"].as_array().unwrap().is_empty());
}
