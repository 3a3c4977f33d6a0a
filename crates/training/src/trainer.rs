use std::path::{Path, PathBuf};

use model::Model;
use tracing::{debug, info, warn};

use crate::{
    checkpoint::{
        self, apply_model_weights, fingerprint_config, CheckpointSelector, NamedTensor,
        RngSnapshot, SelectorState, TrainerState,
    },
    config::{BatchLimit, SchedulerInterval},
    context::{DataSplit, RunContext},
    data::{DataLoader, RandomDataset},
    logging::{Logger, LoggingSettings},
    loss::{LossOutput, MseLoss},
    metrics::{EvaluationMetrics, EvaluationSummary, Metric, MetricMap, TrainingMetrics},
    optimizer::{OptimizerConfig, TrainerOptimizer, TrainerOptimizerOptions},
    scheduler::{LRScheduler, SchedulerConfig},
    TrainingConfig, TrainingError,
};

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerStatus {
    NotStarted,
    /// State was loaded from a checkpoint; the next `fit` continues after it.
    Restored,
    Running,
    Validated,
    CheckpointDecision,
    Interrupted,
    Finished,
}

pub struct Trainer {
    config: TrainingConfig,
    context: RunContext,
    model: Model,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    loss: MseLoss,
    train_loader: DataLoader,
    val_loader: DataLoader,
    test_loader: DataLoader,
    selector: CheckpointSelector,
    logger: Logger,
    config_sha256: String,
    next_epoch: usize,
    global_step: usize,
    status: TrainerStatus,
    resumed_from: Option<PathBuf>,
}

struct EpochOutcome {
    train_loss: Option<f64>,
    learning_rate: f64,
    interrupted: bool,
}

impl Trainer {
    pub fn new(config: TrainingConfig, context: RunContext) -> Result<Self, TrainingError> {
        config.validate()?;

        let model = Model::new(config.model_config(&context)).map_err(|err| {
            TrainingError::initialization(format!("failed to build model: {err}"))
        })?;
        info!(
            parameters = model.num_parameters(),
            seed = context.seed(),
            "initialized model"
        );

        let mut optimizer = TrainerOptimizer::new(
            model.parameters(),
            OptimizerConfig::from(&config.optimizer),
            TrainerOptimizerOptions {
                clip_global_norm: config.optimizer.max_grad_norm,
            },
        )?;

        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
        )?
        .build(config.scheduler.interval)?;
        optimizer.set_learning_rate(scheduler.learning_rate());

        let data = &config.data;
        let device = context.device().clone();
        let loader = |split: DataSplit, samples: usize, shuffle: bool| {
            let dataset = RandomDataset::generate(
                split,
                samples,
                data.input_dim,
                config.model.output_dim,
                data.target_value,
                &context,
            )?;
            DataLoader::new(dataset, data.batch_size, shuffle, device.clone())
        };
        let train_loader = loader(DataSplit::Train, data.train_samples, data.shuffle)?;
        let val_loader = loader(DataSplit::Validation, data.val_samples, false)?;
        let test_loader = loader(DataSplit::Test, data.test_samples, false)?;

        let selector = CheckpointSelector::new(
            config.runtime.checkpoint.clone(),
            config.runtime.checkpoint_dir(),
        )?;

        let logger = Logger::new(LoggingSettings::from_config(
            &config.runtime.logging,
            &config.runtime.default_root_dir,
        ))?;
        if let Some(dir) = logger.log_dir() {
            info!(log_dir = %dir.display(), "logging metrics");
        }

        let config_sha256 = fingerprint_config(&config)?;

        Ok(Self {
            config,
            context,
            model,
            optimizer,
            scheduler,
            loss: MseLoss::new(),
            train_loader,
            val_loader,
            test_loader,
            selector,
            logger,
            config_sha256,
            next_epoch: 0,
            global_step: 0,
            status: TrainerStatus::NotStarted,
            resumed_from: None,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn status(&self) -> TrainerStatus {
        self.status
    }

    /// Epoch the next call to `fit` starts at.
    pub fn current_epoch(&self) -> usize {
        self.next_epoch
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn selector(&self) -> &CheckpointSelector {
        &self.selector
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.selector.best_model_path()
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.logger.log_dir()
    }

    pub fn resumed_from(&self) -> Option<&Path> {
        self.resumed_from.as_deref()
    }

    /// Loads `path` and applies it. The next `fit` continues at the epoch after
    /// the checkpointed one.
    pub fn resume_from_path(&mut self, path: &Path) -> Result<(), TrainingError> {
        let state = checkpoint::resume(path)?;
        self.apply_state(state, path)?;
        self.resumed_from = Some(path.to_path_buf());
        Ok(())
    }

    /// Snapshot of everything a resumed run needs. Fails until at least one
    /// epoch has completed, since a checkpoint always names a finished epoch.
    pub fn trainer_state(&self) -> Result<TrainerState, TrainingError> {
        let Some(epoch) = self.next_epoch.checked_sub(1) else {
            return Err(TrainingError::runtime(
                "no epoch has completed yet; there is no trainer state to capture",
            ));
        };
        capture_state(
            epoch,
            self.global_step,
            &self.model,
            &self.optimizer,
            &*self.scheduler,
            Some(self.selector.state()),
            &self.context,
            &self.config_sha256,
        )
    }

    pub fn fit(&mut self) -> Result<(), TrainingError> {
        self.fit_with_shutdown(|| false)
    }

    /// Runs epochs until `runtime.max_epochs`, checking `should_stop` before
    /// every step. A stopped run leaves the trainer `Interrupted`.
    pub fn fit_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        if self.resumed_from.is_none() {
            if let Some(path) = self.config.runtime.resume_from_checkpoint.clone() {
                self.resume_from_path(&path)?;
            }
        }

        let max_epochs = self.config.runtime.max_epochs;
        if self.next_epoch >= max_epochs {
            info!(
                next_epoch = self.next_epoch,
                max_epochs, "max_epochs already reached; nothing to train"
            );
            self.status = TrainerStatus::Finished;
            return Ok(());
        }

        info!(
            start_epoch = self.next_epoch,
            max_epochs,
            global_step = self.global_step,
            device = ?self.context.device(),
            "starting training"
        );

        let validation_every = self.config.runtime.check_val_every_n_epoch.max(1);
        for epoch in self.next_epoch..max_epochs {
            self.status = TrainerStatus::Running;
            let outcome = self.train_epoch(epoch, &mut should_stop)?;
            if outcome.interrupted {
                warn!(epoch, global_step = self.global_step, "training interrupted");
                self.status = TrainerStatus::Interrupted;
                self.logger.flush();
                return Ok(());
            }

            let mut metrics = MetricMap::new();
            if let Some(loss) = outcome.train_loss {
                metrics.insert(Metric::TrainLoss, loss);
            }
            metrics.insert(Metric::LearningRate, outcome.learning_rate);
            self.logger
                .log_epoch(epoch, self.global_step, outcome.train_loss);

            let validated =
                (epoch + 1) % validation_every == 0 && self.validate_epoch(epoch, &mut metrics)?;

            if self.scheduler.interval() == SchedulerInterval::Epoch {
                let lr = self.scheduler.step();
                self.optimizer.set_learning_rate(lr);
            }

            if validated || !self.runs_validation() {
                self.status = TrainerStatus::CheckpointDecision;
                self.checkpoint_decision(epoch, &metrics)?;
            }
            self.next_epoch = epoch + 1;
        }

        self.status = TrainerStatus::Finished;
        self.logger.flush();
        info!(
            global_step = self.global_step,
            best_model_path = ?self.best_model_path(),
            "training finished"
        );
        Ok(())
    }

    /// Average loss of the current weights over the validation split.
    pub fn validate(&mut self) -> Result<Option<EvaluationSummary>, TrainingError> {
        let summary = self.evaluate(DataSplit::Validation)?;
        if let Some(summary) = &summary {
            let epoch = self.next_epoch.saturating_sub(1);
            self.logger.log_validation(epoch, self.global_step, summary);
            self.logger.flush();
        }
        Ok(summary)
    }

    /// Average loss of the current weights over the test split.
    pub fn test(&mut self) -> Result<EvaluationSummary, TrainingError> {
        let summary = self
            .evaluate(DataSplit::Test)?
            .ok_or_else(|| TrainingError::runtime("test split produced no batches"))?;
        let epoch = self.next_epoch.saturating_sub(1);
        self.logger.log_test(epoch, self.global_step, &summary);
        self.logger.flush();
        info!(loss = summary.average_loss, samples = summary.samples, "test finished");
        Ok(summary)
    }

    /// Loads only the model weights stored at `path` and runs the test split.
    pub fn test_checkpoint(&mut self, path: &Path) -> Result<EvaluationSummary, TrainingError> {
        let state = checkpoint::resume(path)?;
        apply_model_weights(&self.model, &state.model_weights, path)?;
        self.test()
    }

    fn apply_state(&mut self, state: TrainerState, path: &Path) -> Result<(), TrainingError> {
        let TrainerState {
            epoch,
            global_step,
            model_weights,
            optimizer,
            scheduler,
            selector,
            rng,
            config_sha256,
        } = state;

        apply_model_weights(&self.model, &model_weights, path)?;
        self.optimizer
            .load_state(optimizer)
            .map_err(|err| TrainingError::corrupt(path, err.to_string()))?;
        if let Some(snapshot) = scheduler {
            self.scheduler
                .load_snapshot(&snapshot)
                .map_err(|err| TrainingError::corrupt(path, err.to_string()))?;
        }
        if let Some(selector) = selector {
            self.selector.load_state(selector);
        }

        if rng.seed != self.context.seed() {
            warn!(
                checkpoint_seed = rng.seed,
                run_seed = self.context.seed(),
                "checkpoint was written with a different seed; data order follows the current run"
            );
        }
        if config_sha256.as_deref() != Some(self.config_sha256.as_str()) {
            debug!("configuration differs from the one the checkpoint was written with");
        }

        self.next_epoch = epoch + 1;
        self.global_step = global_step;
        self.status = TrainerStatus::Restored;
        info!(
            resume_epoch = self.next_epoch,
            global_step,
            learning_rate = self.optimizer.learning_rate(),
            "restored trainer state"
        );
        Ok(())
    }

    fn train_epoch<F>(
        &mut self,
        epoch: usize,
        should_stop: &mut F,
    ) -> Result<EpochOutcome, TrainingError>
    where
        F: FnMut() -> bool,
    {
        let limit = batch_limit(
            self.config.runtime.limit_train_batches.as_ref(),
            self.train_loader.num_batches(),
        );
        let log_every = self.config.runtime.log_every_n_steps.max(1);
        let learning_rate = self.optimizer.learning_rate();
        let mut metrics = TrainingMetrics::new();

        for batch in self.train_loader.epoch(epoch, limit, &self.context) {
            if should_stop() {
                return Ok(EpochOutcome {
                    train_loss: metrics.epoch_loss(),
                    learning_rate,
                    interrupted: true,
                });
            }
            let batch = batch?;

            let predictions = self
                .model
                .forward(&batch.features)
                .map_err(to_runtime_error)?;
            let LossOutput {
                loss,
                metrics: loss_metrics,
            } = self.loss.compute(&predictions, &batch.targets)?;
            let grads = loss.backward().map_err(to_runtime_error)?;

            let lr = self.optimizer.learning_rate();
            let grad_norm = self.optimizer.step(&grads)?;
            self.global_step += 1;

            if self.scheduler.interval() == SchedulerInterval::Step {
                let next_lr = self.scheduler.step();
                self.optimizer.set_learning_rate(next_lr);
            }

            let snapshot = metrics.record_step(
                batch.rows as u64,
                loss_metrics.average_loss() as f64,
                grad_norm,
            );
            if self.global_step % log_every == 0 {
                self.logger
                    .log_training_step(epoch, self.global_step, lr, &snapshot);
            }
        }

        Ok(EpochOutcome {
            train_loss: metrics.epoch_loss(),
            learning_rate,
            interrupted: false,
        })
    }

    fn evaluate(&self, split: DataSplit) -> Result<Option<EvaluationSummary>, TrainingError> {
        let (loader, limit) = match split {
            DataSplit::Train => (&self.train_loader, self.config.runtime.limit_train_batches),
            DataSplit::Validation => (&self.val_loader, self.config.runtime.limit_val_batches),
            DataSplit::Test => (&self.test_loader, self.config.runtime.limit_test_batches),
        };
        let limit = batch_limit(limit.as_ref(), loader.num_batches());

        let mut metrics = EvaluationMetrics::default();
        for batch in loader.epoch(0, limit, &self.context) {
            let batch = batch?;
            let predictions = self
                .model
                .forward(&batch.features)
                .map_err(to_runtime_error)?;
            let output = self.loss.compute(&predictions, &batch.targets)?;
            metrics.update(output.metrics.average_loss() as f64, batch.rows as u64);
        }
        Ok(metrics.finalize())
    }

    /// Runs the validation split for `epoch` and records `val_loss`. Returns
    /// false, leaving the status untouched, when no batch was evaluated.
    fn validate_epoch(
        &mut self,
        epoch: usize,
        metrics: &mut MetricMap,
    ) -> Result<bool, TrainingError> {
        let Some(summary) = self.evaluate(DataSplit::Validation)? else {
            return Ok(false);
        };
        self.logger.log_validation(epoch, self.global_step, &summary);
        metrics.insert(Metric::ValLoss, summary.average_loss);
        self.status = TrainerStatus::Validated;
        Ok(true)
    }

    /// False when validation is configured away entirely, either by an empty
    /// split or by a batch limit that resolves to zero.
    fn runs_validation(&self) -> bool {
        batch_limit(
            self.config.runtime.limit_val_batches.as_ref(),
            self.val_loader.num_batches(),
        ) > 0
    }

    fn checkpoint_decision(
        &mut self,
        epoch: usize,
        metrics: &MetricMap,
    ) -> Result<(), TrainingError> {
        let Self {
            ref mut selector,
            ref model,
            ref optimizer,
            ref scheduler,
            ref context,
            ref config_sha256,
            global_step,
            ..
        } = *self;

        selector.on_validation_end(epoch, global_step, metrics, |selector_state| {
            capture_state(
                epoch,
                global_step,
                model,
                optimizer,
                &**scheduler,
                Some(selector_state),
                context,
                config_sha256,
            )
        })?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_state(
    epoch: usize,
    global_step: usize,
    model: &Model,
    optimizer: &TrainerOptimizer,
    scheduler: &dyn LRScheduler,
    selector: Option<SelectorState>,
    context: &RunContext,
    config_sha256: &str,
) -> Result<TrainerState, TrainingError> {
    let model_weights = model
        .parameters()
        .into_iter()
        .map(|(name, var)| NamedTensor::from_tensor(name, var.as_tensor()))
        .collect::<candle_core::Result<Vec<_>>>()
        .map_err(to_runtime_error)?;

    Ok(TrainerState {
        epoch,
        global_step,
        model_weights,
        optimizer: optimizer.state()?,
        scheduler: Some(scheduler.snapshot()),
        selector,
        rng: RngSnapshot {
            seed: context.seed(),
        },
        config_sha256: Some(config_sha256.to_string()),
    })
}

fn batch_limit(limit: Option<&BatchLimit>, available: usize) -> usize {
    limit.map_or(available, |limit| limit.resolve(available))
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;

    fn small_config(root: &Path) -> TrainingConfig {
        let mut config = TrainingConfig::default();
        config.model.input_dim = 3;
        config.data.input_dim = 3;
        config.data.train_samples = 4;
        config.data.val_samples = 4;
        config.data.test_samples = 4;
        config.runtime.default_root_dir = root.to_path_buf();
        config.runtime.logging = LoggingConfig {
            enable_stdout: false,
            tensorboard: false,
            flush_every_n: 1,
        };
        config
    }

    #[test]
    fn validated_status_requires_an_evaluated_batch() {
        let root = tempfile::tempdir().unwrap();
        let mut config = small_config(root.path());
        config.runtime.limit_val_batches = Some(BatchLimit::Count(0));
        let mut trainer = Trainer::new(config, RunContext::new(2)).unwrap();

        let mut metrics = MetricMap::new();
        assert!(!trainer.validate_epoch(0, &mut metrics).unwrap());
        assert_eq!(trainer.status(), TrainerStatus::NotStarted);
        assert!(metrics.get(Metric::ValLoss).is_none());
        assert!(!trainer.runs_validation());

        let mut trainer = Trainer::new(small_config(root.path()), RunContext::new(2)).unwrap();
        assert!(trainer.validate_epoch(0, &mut metrics).unwrap());
        assert_eq!(trainer.status(), TrainerStatus::Validated);
        assert!(metrics.get(Metric::ValLoss).is_some());
        assert!(trainer.runs_validation());
    }

    #[test]
    fn fractional_limit_rounding_to_zero_disables_validation() {
        let root = tempfile::tempdir().unwrap();
        let mut config = small_config(root.path());
        config.runtime.limit_val_batches = Some(BatchLimit::Fraction(0.1));
        let trainer = Trainer::new(config, RunContext::new(2)).unwrap();
        assert!(!trainer.runs_validation());
    }
}
