use std::{
    fs,
    path::{Path, PathBuf},
};

use model::{Activation, LinearInit, ModelConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{checkpoint::SelectorConfig, context::RunContext};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model.input_dim == 0 {
            errors.push("model.input_dim must be greater than 0".to_string());
        }

        if self.model.output_dim == 0 {
            errors.push("model.output_dim must be greater than 0".to_string());
        }

        if self.model.hidden_dims.iter().any(|&dim| dim == 0) {
            errors.push("model.hidden_dims entries must be greater than 0".to_string());
        }

        if self.data.input_dim != self.model.input_dim {
            errors.push(format!(
                "data.input_dim ({}) must match model.input_dim ({})",
                self.data.input_dim, self.model.input_dim
            ));
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.train_samples == 0 {
            errors.push("data.train_samples must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }

        if !(0.0..=1.0).contains(&self.optimizer.dampening) {
            errors.push("optimizer.dampening must be in [0, 1]".to_string());
        }

        if self.optimizer.nesterov
            && (self.optimizer.momentum <= 0.0 || self.optimizer.dampening != 0.0)
        {
            errors.push(
                "optimizer.nesterov requires momentum > 0 and zero dampening".to_string(),
            );
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.scheduler.step_size == 0 {
            errors.push("scheduler.step_size must be greater than 0".to_string());
        }

        if !(self.scheduler.gamma > 0.0 && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1]".to_string());
        }

        if let Some(steps) = self.scheduler.total_steps {
            if steps == 0 {
                errors.push("scheduler.total_steps must be greater than 0".to_string());
            }
            if let Some(warmup) = self.scheduler.warmup_steps {
                if warmup > steps {
                    errors.push(
                        "scheduler.warmup_steps cannot exceed scheduler.total_steps".to_string(),
                    );
                }
            }
        } else if self.scheduler.strategy.requires_horizon() {
            errors.push(format!(
                "scheduler.total_steps is required for the {:?} strategy",
                self.scheduler.strategy
            ));
        }

        if let Some(min_lr) = self.scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }

        if self.runtime.max_epochs == 0 {
            errors.push("runtime.max_epochs must be greater than 0".to_string());
        }

        for (label, limit) in [
            ("runtime.limit_train_batches", self.runtime.limit_train_batches),
            ("runtime.limit_val_batches", self.runtime.limit_val_batches),
            ("runtime.limit_test_batches", self.runtime.limit_test_batches),
        ] {
            if let Some(limit) = limit {
                if let Err(message) = limit.check() {
                    errors.push(format!("{label} {message}"));
                }
            }
        }

        if self.runtime.check_val_every_n_epoch == 0 {
            errors.push("runtime.check_val_every_n_epoch must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        errors.extend(self.runtime.checkpoint.problems());

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Model hyperparameters bound to the run's seed and device.
    pub fn model_config(&self, context: &RunContext) -> ModelConfig {
        ModelConfig {
            input_dim: self.model.input_dim,
            hidden_dims: self.model.hidden_dims.clone(),
            output_dim: self.model.output_dim,
            activation: self.model.activation,
            init: self.model.init,
            bias: self.model.bias,
            dtype: candle_core::DType::F32,
            device: context.device().clone(),
            seed: context.seed(),
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default)]
    pub hidden_dims: Vec<usize>,
    #[serde(default = "default_output_dim")]
    pub output_dim: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub init: LinearInit,
    #[serde(default = "default_true")]
    pub bias: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            hidden_dims: Vec::new(),
            output_dim: default_output_dim(),
            activation: Activation::default(),
            init: LinearInit::default(),
            bias: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_input_dim")]
    pub input_dim: usize,
    #[serde(default = "default_samples")]
    pub train_samples: usize,
    #[serde(default = "default_samples")]
    pub val_samples: usize,
    #[serde(default = "default_samples")]
    pub test_samples: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub shuffle: bool,
    /// Constant regression target for every output unit.
    #[serde(default = "default_target_value")]
    pub target_value: f32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            input_dim: default_input_dim(),
            train_samples: default_samples(),
            val_samples: default_samples(),
            test_samples: default_samples(),
            batch_size: default_batch_size(),
            shuffle: false,
            target_value: default_target_value(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default)]
    pub nesterov: bool,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            momentum: 0.0,
            dampening: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Sgd,
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default)]
    pub interval: SchedulerInterval,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default)]
    pub warmup_steps: Option<usize>,
    /// Horizon in scheduler ticks (epochs or optimizer steps, per `interval`).
    #[serde(default)]
    pub total_steps: Option<usize>,
    #[serde(default)]
    pub min_lr: Option<f64>,
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            interval: SchedulerInterval::default(),
            step_size: default_step_size(),
            gamma: default_gamma(),
            warmup_steps: None,
            total_steps: None,
            min_lr: None,
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    Step,
    Cosine,
    CosineWithWarmup,
    Polynomial,
}

impl LearningRateSchedule {
    fn requires_horizon(&self) -> bool {
        matches!(
            self,
            LearningRateSchedule::Cosine
                | LearningRateSchedule::CosineWithWarmup
                | LearningRateSchedule::Polynomial
        )
    }
}

/// When the scheduler advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerInterval {
    #[default]
    Epoch,
    Step,
}

/// Caps the number of batches a loop consumes per epoch.
///
/// Integers are absolute batch counts; floats are a fraction of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchLimit {
    Count(usize),
    Fraction(f64),
}

impl BatchLimit {
    pub fn resolve(&self, available: usize) -> usize {
        match *self {
            BatchLimit::Count(count) => count.min(available),
            BatchLimit::Fraction(fraction) => {
                ((available as f64 * fraction).floor() as usize).min(available)
            }
        }
    }

    fn check(&self) -> Result<(), String> {
        match *self {
            BatchLimit::Count(_) => Ok(()),
            BatchLimit::Fraction(fraction) if fraction > 0.0 && fraction <= 1.0 => Ok(()),
            BatchLimit::Fraction(fraction) => {
                Err(format!("fraction must be in (0, 1] (got {fraction})"))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_root_dir")]
    pub default_root_dir: PathBuf,
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    #[serde(default)]
    pub limit_train_batches: Option<BatchLimit>,
    #[serde(default)]
    pub limit_val_batches: Option<BatchLimit>,
    #[serde(default)]
    pub limit_test_batches: Option<BatchLimit>,
    #[serde(default = "default_one")]
    pub check_val_every_n_epoch: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub resume_from_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint: SelectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_root_dir: default_root_dir(),
            max_epochs: default_max_epochs(),
            limit_train_batches: None,
            limit_val_batches: None,
            limit_test_batches: None,
            check_val_every_n_epoch: default_one(),
            log_every_n_steps: default_log_every_n_steps(),
            resume_from_checkpoint: None,
            checkpoint: SelectorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Directory checkpoints are written to; falls back to the root directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .dirpath
            .clone()
            .unwrap_or_else(|| self.default_root_dir.clone())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.default_root_dir, base);
        if let Some(path) = self.resume_from_checkpoint.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(dir) = self.checkpoint.dirpath.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_flush_every_n")]
    pub flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: true,
            flush_every_n: default_flush_every_n(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_input_dim() -> usize {
    32
}

fn default_output_dim() -> usize {
    2
}

fn default_samples() -> usize {
    64
}

fn default_batch_size() -> usize {
    1
}

fn default_target_value() -> f32 {
    1.0
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_step_size() -> usize {
    1
}

fn default_gamma() -> f64 {
    0.1
}

fn default_power() -> f64 {
    1.0
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_epochs() -> usize {
    1
}

fn default_one() -> usize {
    1
}

fn default_log_every_n_steps() -> usize {
    50
}

fn default_flush_every_n() -> usize {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("monitored metric '{metric}' was not logged (available: {})", available.join(", "))]
    MissingMetric {
        metric: String,
        available: Vec<String>,
    },
    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{MonitorMode, SavePolicy},
        metrics::Metric,
    };

    #[test]
    fn toml_sections_fill_defaults() {
        let raw = r#"
            [optimizer]
            learning_rate = 0.05

            [scheduler]
            strategy = "step"
            gamma = 0.5

            [runtime]
            max_epochs = 3
            limit_train_batches = 12
            limit_val_batches = 0.5

            [runtime.checkpoint]
            monitor = "val_loss"
            filename = "{epoch:02d}"
            save_policy = "every_epoch"
        "#;
        let config: TrainingConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.model.input_dim, 32);
        assert_eq!(config.data.batch_size, 1);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
        assert_eq!(config.scheduler.strategy, LearningRateSchedule::Step);
        assert_eq!(config.scheduler.step_size, 1);
        assert_eq!(config.runtime.limit_train_batches, Some(BatchLimit::Count(12)));
        assert_eq!(config.runtime.limit_val_batches, Some(BatchLimit::Fraction(0.5)));
        assert_eq!(config.runtime.checkpoint.monitor, Some(Metric::ValLoss));
        assert_eq!(config.runtime.checkpoint.mode, MonitorMode::Min);
        assert_eq!(config.runtime.checkpoint.save_policy, SavePolicy::EveryEpoch);
    }

    #[test]
    fn top_k_policy_parses_from_table() {
        let raw = r#"
            [runtime.checkpoint]
            mode = "max"
            save_policy = { top_k = 3 }
        "#;
        let config: TrainingConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.runtime.checkpoint.save_policy, SavePolicy::TopK(3));
        assert_eq!(config.runtime.checkpoint.mode, MonitorMode::Max);
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.data.batch_size = 0;
        config.data.input_dim = 16;
        config.optimizer.learning_rate = 0.0;
        config.runtime.limit_train_batches = Some(BatchLimit::Fraction(1.5));

        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
                assert!(messages.iter().any(|m| m.contains("data.input_dim")));
                assert!(messages.iter().any(|m| m.contains("limit_train_batches")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn cosine_requires_horizon() {
        let mut config = TrainingConfig::default();
        config.scheduler.strategy = LearningRateSchedule::Cosine;
        assert!(config.validate().is_err());
        config.scheduler.total_steps = Some(10);
        config.validate().unwrap();
    }

    #[test]
    fn batch_limit_resolution() {
        assert_eq!(BatchLimit::Count(12).resolve(64), 12);
        assert_eq!(BatchLimit::Count(100).resolve(64), 64);
        assert_eq!(BatchLimit::Fraction(0.25).resolve(64), 16);
        assert_eq!(BatchLimit::Fraction(1.0).resolve(7), 7);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(
            &path,
            "[runtime]\ndefault_root_dir = \"runs\"\nresume_from_checkpoint = \"runs/epoch=00.ckpt\"\n",
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.runtime.default_root_dir, dir.path().join("runs"));
        assert_eq!(
            config.runtime.resume_from_checkpoint,
            Some(dir.path().join("runs/epoch=00.ckpt"))
        );
        assert_eq!(config.runtime.checkpoint_dir(), dir.path().join("runs"));
    }
}
