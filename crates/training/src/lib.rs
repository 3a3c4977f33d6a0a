pub mod checkpoint;
pub mod config;
pub mod context;
pub mod data;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod overrides;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    CheckpointRecord, CheckpointSelector, MonitorMode, SavePolicy, SelectorConfig, TrainerState,
};
pub use config::{TrainingConfig, TrainingError};
pub use context::{DataSplit, RunContext};
pub use data::{DataBatch, DataLoader, RandomDataset};
pub use loss::{LossMetrics, LossOutput, MseLoss};
pub use metrics::{EvaluationSummary, Metric, MetricMap};
pub use optimizer::{OptimizerConfig, OptimizerState, TrainerOptimizer, TrainerOptimizerOptions};
pub use overrides::{apply_overrides, ConfigOverride};
pub use scheduler::{LRScheduler, SchedulerConfig, SchedulerState};
pub use trainer::{Trainer, TrainerStatus};
