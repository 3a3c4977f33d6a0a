use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Scalars the trainer logs and the checkpoint selector can monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TrainLoss,
    ValLoss,
    LearningRate,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::TrainLoss => "train_loss",
            Metric::ValLoss => "val_loss",
            Metric::LearningRate => "learning_rate",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics logged during one epoch, keyed by [`Metric`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricMap {
    values: BTreeMap<Metric, f64>,
}

impl MetricMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: Metric, value: f64) {
        self.values.insert(metric, value);
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    /// Looks a value up by its logged name.
    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(metric, _)| metric.as_str() == name)
            .map(|(_, value)| *value)
    }

    pub fn names(&self) -> Vec<String> {
        self.values.keys().map(|metric| metric.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().map(|(metric, value)| (*metric, *value))
    }
}

impl FromIterator<(Metric, f64)> for MetricMap {
    fn from_iter<I: IntoIterator<Item = (Metric, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running statistics for the optimisation loop of one epoch.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    loss_sum: f64,
    samples: u64,
    loss_ema: ExponentialMovingAverage,
    grad_norm_ema: ExponentialMovingAverage,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            loss_sum: 0.0,
            samples: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            grad_norm_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, samples: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.loss_sum += loss * samples as f64;
        self.samples = self.samples.saturating_add(samples);
        let samples_per_sec = if step_duration > Duration::ZERO {
            samples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            samples,
            samples_per_sec,
            grad_norm: self.grad_norm_ema.update(grad_norm),
            raw_grad_norm: grad_norm,
            wall_time: now.duration_since(self.start_time),
            step_duration,
        }
    }

    /// Sample-weighted mean loss since construction.
    pub fn epoch_loss(&self) -> Option<f64> {
        if self.samples == 0 {
            None
        } else {
            Some(self.loss_sum / self.samples as f64)
        }
    }
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    pub loss: f64,
    pub step_loss: f64,
    pub samples: u64,
    pub samples_per_sec: f64,
    pub grad_norm: f64,
    pub raw_grad_norm: f64,
    pub wall_time: Duration,
    pub step_duration: Duration,
}

#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    samples: u64,
    batches: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, samples: u64) {
        self.loss_sum += loss * samples as f64;
        self.samples += samples;
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.samples == 0 {
            None
        } else {
            Some(EvaluationSummary {
                average_loss: self.loss_sum / self.samples as f64,
                batches: self.batches,
                samples: self.samples,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationSummary {
    pub average_loss: f64,
    pub batches: usize,
    pub samples: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_weights_by_samples() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(1.0, 3);
        metrics.update(3.0, 1);
        let summary = metrics.finalize().unwrap();
        assert!((summary.average_loss - 1.5).abs() < 1e-12);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn empty_evaluation_has_no_summary() {
        assert!(EvaluationMetrics::default().finalize().is_none());
    }

    #[test]
    fn metric_map_lookup_by_name() {
        let map: MetricMap = [(Metric::ValLoss, 0.5), (Metric::TrainLoss, 0.7)]
            .into_iter()
            .collect();
        assert_eq!(map.get_by_name("val_loss"), Some(0.5));
        assert_eq!(map.get(Metric::LearningRate), None);
        assert_eq!(map.names(), vec!["train_loss", "val_loss"]);
    }

    #[test]
    fn ema_starts_at_first_sample() {
        let mut ema = ExponentialMovingAverage::new(0.5);
        assert_eq!(ema.update(4.0), 4.0);
        assert_eq!(ema.update(2.0), 3.0);
        assert_eq!(ema.value(), Some(3.0));
    }
}
