//! bulwark-autoscale — utilization-driven replica recommendations.
//!
//! Callers report CPU, memory and custom metric readings; the scaler turns
//! them into a desired replica count and hands changes to a pluggable
//! [`ScalingExecutor`].
//!
//! # Scaling Algorithm
//!
//! ```text
//! reactive   = max over cpu, memory, custom metrics of
//!                ceil(current * observed / target)     (custom: × weight)
//! predictive = max over confident forecasts of ceil(current * predicted)
//! desired    = clamp(max(reactive, predictive), min_replicas, max_replicas)
//!
//! desired > current and scale_up_cooldown passed   → ScaleUp
//! desired < current and scale_down_cooldown passed → ScaleDown
//! ```
//!
//! Forecasts need at least ten samples and count only at confidence
//! ≥ 0.7. Cooldowns start when an action is applied successfully, so a
//! failed action can be retried on the next evaluation.

mod action;
mod config;
mod error;
mod predictor;
mod scaler;

pub use action::{ActionType, LoggingExecutor, ScalingAction, ScalingEvent, ScalingExecutor};
pub use config::{
    AutoScalerConfig, CustomMetric, PredictionAlgorithm, PredictorConfig, PredictorSet,
    ScaleDirection,
};
pub use error::{ScalerError, ScalerResult};
pub use predictor::{LoadPrediction, LoadPredictor, LoadSample, MIN_CONFIDENCE, MIN_SAMPLES};
pub use scaler::{AutoScaler, Recommendation, ScalerMetrics};
