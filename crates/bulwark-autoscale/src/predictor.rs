//! Short-horizon load forecasts from a bounded sample window.

use std::collections::VecDeque;
use std::time::Duration;

use bulwark_core::duration::human;
use serde::Serialize;

use crate::config::{PredictionAlgorithm, PredictorConfig};

/// Fewer samples than this never produce a prediction.
pub const MIN_SAMPLES: usize = 10;

/// Only predictions at least this confident affect the replica count.
pub const MIN_CONFIDENCE: f64 = 0.7;

const SMOOTHING_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSample {
    pub at_unix: u64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadPrediction {
    /// Unix seconds the prediction is for.
    pub target_unix: u64,
    pub predicted_value: f64,
    pub confidence: f64,
    pub algorithm: PredictionAlgorithm,
    #[serde(with = "human")]
    pub horizon: Duration,
}

impl LoadPrediction {
    pub fn is_confident(&self) -> bool {
        self.confidence >= MIN_CONFIDENCE
    }
}

#[derive(Debug, Clone)]
pub struct LoadPredictor {
    name: String,
    config: PredictorConfig,
    samples: VecDeque<LoadSample>,
}

impl LoadPredictor {
    pub fn new(name: impl Into<String>, config: PredictorConfig) -> Self {
        Self {
            name: name.into(),
            samples: VecDeque::with_capacity(config.window_size),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn record(&mut self, sample: LoadSample) {
        if self.samples.len() == self.config.window_size {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn predict(&self, now_unix: u64) -> Option<LoadPrediction> {
        if self.samples.len() < MIN_SAMPLES {
            return None;
        }
        let (predicted, confidence) = match self.config.algorithm {
            PredictionAlgorithm::Linear => self.linear(),
            PredictionAlgorithm::Exponential => self.exponential(),
        };
        Some(LoadPrediction {
            target_unix: now_unix + self.config.horizon.as_secs(),
            predicted_value: predicted.max(0.0),
            confidence: confidence.clamp(0.0, 1.0),
            algorithm: self.config.algorithm,
            horizon: self.config.horizon,
        })
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.value)
    }

    /// Fit y = slope * i + intercept and extend it by the horizon, one
    /// step per minute.
    fn linear(&self) -> (f64, f64) {
        let n = self.samples.len() as f64;
        let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
        for (i, y) in self.values().enumerate() {
            let x = i as f64;
            sx += x;
            sy += y;
            sxy += x * y;
            sxx += x * x;
        }
        let denom = n * sxx - sx * sx;
        let slope = if denom == 0.0 { 0.0 } else { (n * sxy - sx * sy) / denom };
        let intercept = (sy - slope * sx) / n;

        let future_x = n + self.config.horizon.as_secs_f64() / 60.0;
        let predicted = slope * future_x + intercept;

        let variance = self
            .values()
            .enumerate()
            .map(|(i, y)| (y - (slope * i as f64 + intercept)).powi(2))
            .sum::<f64>()
            / n;
        (predicted, 1.0 - variance / predicted.max(0.1))
    }

    fn exponential(&self) -> (f64, f64) {
        let mut values = self.values();
        let first = values.next().unwrap_or_default();
        let smoothed = values.fold(first, |level, y| SMOOTHING_ALPHA * y + (1.0 - SMOOTHING_ALPHA) * level);

        let recent = self.samples.back().map_or(smoothed, |s| s.value);
        let predicted = smoothed + (recent - smoothed);

        let window = self.samples.len().min(MIN_SAMPLES);
        let variance = self
            .values()
            .skip(self.samples.len() - window)
            .map(|y| (y - smoothed).powi(2))
            .sum::<f64>()
            / window as f64;
        (predicted, 1.0 - variance / predicted.max(0.1))
    }
}
