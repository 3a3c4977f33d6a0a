//! Decides which epochs are persisted and which checkpoint is the best so far.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    filename::FilenameTemplate, save_trainer_state, TrainerState, CHECKPOINT_EXTENSION,
};
use crate::{
    metrics::{Metric, MetricMap},
    TrainingError,
};

pub const LAST_CHECKPOINT_STEM: &str = "last";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    #[default]
    Min,
    Max,
}

/// Which checkpoints survive on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Persist every considered epoch and never delete.
    EveryEpoch,
    /// Keep only the best checkpoint.
    #[default]
    BestOnly,
    /// Keep the `k` best checkpoints.
    TopK(usize),
}

impl SavePolicy {
    fn capacity(&self) -> Option<usize> {
        match self {
            SavePolicy::EveryEpoch => None,
            SavePolicy::BestOnly => Some(1),
            SavePolicy::TopK(k) => Some(*k),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Defaults to the trainer's root directory.
    #[serde(default)]
    pub dirpath: Option<PathBuf>,
    /// File-name template, see [`FilenameTemplate`].
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub monitor: Option<Metric>,
    #[serde(default)]
    pub mode: MonitorMode,
    #[serde(default)]
    pub save_policy: SavePolicy,
    #[serde(default = "default_every_n_epochs")]
    pub every_n_epochs: usize,
    #[serde(default)]
    pub save_last: bool,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            dirpath: None,
            filename: None,
            monitor: None,
            mode: MonitorMode::default(),
            save_policy: SavePolicy::default(),
            every_n_epochs: default_every_n_epochs(),
            save_last: false,
        }
    }
}

impl SelectorConfig {
    pub fn template(&self) -> Result<FilenameTemplate, TrainingError> {
        match &self.filename {
            Some(raw) => FilenameTemplate::parse(raw),
            None => Ok(FilenameTemplate::default()),
        }
    }

    /// Configuration problems, phrased for `TrainingConfig::validate`.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.every_n_epochs == 0 {
            problems.push("runtime.checkpoint.every_n_epochs must be greater than 0".to_string());
        }

        match self.save_policy {
            SavePolicy::TopK(0) => problems.push(
                "runtime.checkpoint.save_policy top_k must be greater than 0".to_string(),
            ),
            SavePolicy::TopK(k) if k > 1 && self.monitor.is_none() => problems.push(format!(
                "runtime.checkpoint.save_policy top_k = {k} requires runtime.checkpoint.monitor"
            )),
            _ => {}
        }

        if let Err(TrainingError::Validation(messages)) = self.template() {
            problems.extend(messages);
        }

        problems
    }
}

fn default_every_n_epochs() -> usize {
    1
}

/// One persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub epoch: usize,
    pub global_step: usize,
    pub metric_value: Option<f64>,
    pub file_path: PathBuf,
}

/// Selector bookkeeping stored inside every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorState {
    pub dirpath: PathBuf,
    pub monitor: Option<Metric>,
    pub mode: MonitorMode,
    /// Kept checkpoints, oldest first.
    pub records: Vec<CheckpointRecord>,
    pub best_model_path: Option<PathBuf>,
    pub best_score: Option<f64>,
    pub last_model_path: Option<PathBuf>,
}

pub struct CheckpointSelector {
    config: SelectorConfig,
    dirpath: PathBuf,
    template: FilenameTemplate,
    records: Vec<CheckpointRecord>,
    best_model_path: Option<PathBuf>,
    best_score: Option<f64>,
    last_model_path: Option<PathBuf>,
}

impl CheckpointSelector {
    pub fn new(config: SelectorConfig, dirpath: impl Into<PathBuf>) -> Result<Self, TrainingError> {
        let problems = config.problems();
        if !problems.is_empty() {
            return Err(TrainingError::validation(problems));
        }
        let template = config.template()?;
        Ok(Self {
            config,
            dirpath: dirpath.into(),
            template,
            records: Vec::new(),
            best_model_path: None,
            best_score: None,
            last_model_path: None,
        })
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn dirpath(&self) -> &Path {
        &self.dirpath
    }

    pub fn best_model_path(&self) -> Option<&Path> {
        self.best_model_path.as_deref()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    pub fn last_model_path(&self) -> Option<&Path> {
        self.last_model_path.as_deref()
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn state(&self) -> SelectorState {
        SelectorState {
            dirpath: self.dirpath.clone(),
            monitor: self.config.monitor,
            mode: self.config.mode,
            records: self.records.clone(),
            best_model_path: self.best_model_path.clone(),
            best_score: self.best_score,
            last_model_path: self.last_model_path.clone(),
        }
    }

    /// Restores bookkeeping from a checkpoint. Ranking is only carried over
    /// when the monitor, mode and directory match the current configuration.
    pub fn load_state(&mut self, state: SelectorState) {
        if state.monitor != self.config.monitor
            || state.mode != self.config.mode
            || state.dirpath != self.dirpath
        {
            warn!(
                previous_monitor = ?state.monitor,
                previous_dir = %state.dirpath.display(),
                "checkpoint selector settings changed since the checkpoint; starting a fresh ranking"
            );
            return;
        }

        let (records, missing): (Vec<_>, Vec<_>) = state
            .records
            .into_iter()
            .partition(|record| record.file_path.is_file());
        for record in &missing {
            warn!(
                path = %record.file_path.display(),
                "previously kept checkpoint no longer exists; dropping it from the ranking"
            );
        }

        self.records = records;
        self.refresh_best();
        self.last_model_path = state.last_model_path.filter(|path| path.is_file());
        debug!(kept = self.records.len(), "restored checkpoint selector state");
    }

    /// Called once per validated epoch. `snapshot` receives the selector state
    /// as it will be after this call and returns the trainer state to persist.
    pub fn on_validation_end<F>(
        &mut self,
        epoch: usize,
        global_step: usize,
        metrics: &MetricMap,
        snapshot: F,
    ) -> Result<Option<CheckpointRecord>, TrainingError>
    where
        F: FnOnce(SelectorState) -> Result<TrainerState, TrainingError>,
    {
        if (epoch + 1) % self.config.every_n_epochs != 0 {
            return Ok(None);
        }

        let metric_value = match self.config.monitor {
            Some(metric) => match metrics.get(metric) {
                Some(value) => Some(value),
                None => {
                    let err = TrainingError::MissingMetric {
                        metric: metric.to_string(),
                        available: metrics.names(),
                    };
                    warn!(epoch, "{err}; skipping checkpoint");
                    return Ok(None);
                }
            },
            None => None,
        };

        let (save, evicted) = self.decide(metric_value);
        if !save && !self.config.save_last {
            debug!(epoch, ?metric_value, "checkpoint not in the kept set");
            return Ok(None);
        }

        let mut records = self.records.clone();
        let evicted = evicted.map(|index| records.remove(index));
        let record = if save {
            let stem = self.template.render(epoch, global_step, metrics);
            let record = CheckpointRecord {
                epoch,
                global_step,
                metric_value,
                file_path: self.unique_path(&stem, evicted.as_ref().map(|r| r.file_path.as_path())),
            };
            records.push(record.clone());
            Some(record)
        } else {
            None
        };

        let (best_model_path, best_score) = best_of(self.config.mode, &records);
        let last_model_path = self.config.save_last.then(|| self.path_for(LAST_CHECKPOINT_STEM));
        let next = SelectorState {
            dirpath: self.dirpath.clone(),
            monitor: self.config.monitor,
            mode: self.config.mode,
            records,
            best_model_path,
            best_score,
            last_model_path,
        };
        let state = snapshot(next.clone())?;

        // Every epoch file on disk must be tracked; write `last` before it.
        if let Some(path) = &next.last_model_path {
            save_trainer_state(path, &state)?;
            debug!(path = %path.display(), "updated last checkpoint");
        }
        if let Some(record) = &record {
            save_trainer_state(&record.file_path, &state)?;
            info!(
                epoch,
                global_step,
                path = %record.file_path.display(),
                ?metric_value,
                "saved checkpoint"
            );
        }
        if let Some(evicted) = evicted {
            let overwritten = record
                .as_ref()
                .is_some_and(|record| record.file_path == evicted.file_path);
            if !overwritten {
                match fs::remove_file(&evicted.file_path) {
                    Ok(()) => debug!(path = %evicted.file_path.display(), "removed checkpoint"),
                    Err(err) => warn!(
                        path = %evicted.file_path.display(),
                        "failed to remove evicted checkpoint: {err}"
                    ),
                }
            }
        }

        self.records = next.records;
        self.best_model_path = next.best_model_path;
        self.best_score = next.best_score;
        self.last_model_path = next.last_model_path;
        Ok(record)
    }

    /// Whether a candidate is kept, and which existing record it displaces.
    fn decide(&self, candidate: Option<f64>) -> (bool, Option<usize>) {
        let Some(capacity) = self.config.save_policy.capacity() else {
            return (true, None);
        };
        if self.records.len() < capacity {
            return (true, None);
        }
        let Some(worst) = worst_index(self.config.mode, &self.records) else {
            return (true, None);
        };
        if is_at_least_as_good(self.config.mode, candidate, self.records[worst].metric_value) {
            (true, Some(worst))
        } else {
            (false, None)
        }
    }

    fn refresh_best(&mut self) {
        let (path, score) = best_of(self.config.mode, &self.records);
        self.best_model_path = path;
        self.best_score = score;
    }

    fn path_for(&self, stem: &str) -> PathBuf {
        self.dirpath.join(format!("{stem}.{CHECKPOINT_EXTENSION}"))
    }

    /// Appends `-v1`, `-v2`, ... while the name is taken by a file that is not
    /// about to be replaced.
    fn unique_path(&self, stem: &str, replaceable: Option<&Path>) -> PathBuf {
        let mut path = self.path_for(stem);
        let mut version = 1;
        while path.exists() && Some(path.as_path()) != replaceable {
            path = self.path_for(&format!("{stem}-v{version}"));
            version += 1;
        }
        path
    }
}

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

/// Missing and NaN scores rank last; equal scores favor the candidate.
fn is_at_least_as_good(mode: MonitorMode, candidate: Option<f64>, incumbent: Option<f64>) -> bool {
    match (usable(candidate), usable(incumbent)) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(c), Some(i)) => match mode {
            MonitorMode::Min => c <= i,
            MonitorMode::Max => c >= i,
        },
    }
}

/// Ties resolve to the newest record.
fn best_of(mode: MonitorMode, records: &[CheckpointRecord]) -> (Option<PathBuf>, Option<f64>) {
    let mut best: Option<&CheckpointRecord> = None;
    for record in records {
        let better = best.map_or(true, |current| {
            is_at_least_as_good(mode, record.metric_value, current.metric_value)
        });
        if better {
            best = Some(record);
        }
    }
    match best {
        Some(record) => (Some(record.file_path.clone()), usable(record.metric_value)),
        None => (None, None),
    }
}

/// Ties resolve to the oldest record.
fn worst_index(mode: MonitorMode, records: &[CheckpointRecord]) -> Option<usize> {
    let mut worst: Option<usize> = None;
    for (index, record) in records.iter().enumerate() {
        let strictly_worse = worst.map_or(true, |current| {
            !is_at_least_as_good(mode, record.metric_value, records[current].metric_value)
        });
        if strictly_worse {
            worst = Some(index);
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checkpoint::{load_trainer_state, NamedTensor, RngSnapshot},
        config::OptimizerType,
        optimizer::OptimizerState,
    };

    fn state_for(epoch: usize, selector: SelectorState) -> Result<TrainerState, TrainingError> {
        Ok(TrainerState {
            epoch,
            global_step: (epoch + 1) * 4,
            model_weights: vec![NamedTensor {
                name: "layers.0.weight".into(),
                shape: vec![1, 2],
                values: vec![epoch as f32, 0.5],
            }],
            optimizer: OptimizerState {
                algorithm: OptimizerType::Sgd,
                step: (epoch + 1) * 4,
                learning_rate: 0.1,
                buffers: Vec::new(),
            },
            scheduler: None,
            selector: Some(selector),
            rng: RngSnapshot { seed: 7 },
            config_sha256: None,
        })
    }

    fn val_loss(value: f64) -> MetricMap {
        [(Metric::ValLoss, value), (Metric::TrainLoss, value + 1.0)]
            .into_iter()
            .collect()
    }

    fn config(save_policy: SavePolicy, mode: MonitorMode) -> SelectorConfig {
        SelectorConfig {
            filename: Some("{epoch:02d}".into()),
            monitor: Some(Metric::ValLoss),
            mode,
            save_policy,
            ..SelectorConfig::default()
        }
    }

    fn run(selector: &mut CheckpointSelector, epoch: usize, value: f64) -> Option<CheckpointRecord> {
        selector
            .on_validation_end(epoch, (epoch + 1) * 4, &val_loss(value), |state| {
                state_for(epoch, state)
            })
            .unwrap()
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn every_epoch_keeps_all_and_tracks_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::EveryEpoch, MonitorMode::Min), dir.path())
                .unwrap();

        for (epoch, value) in [0.9, 0.5, 0.7].into_iter().enumerate() {
            assert!(run(&mut selector, epoch, value).is_some());
        }

        assert_eq!(files(dir.path()), ["epoch=00.ckpt", "epoch=01.ckpt", "epoch=02.ckpt"]);
        assert_eq!(selector.best_model_path(), Some(dir.path().join("epoch=01.ckpt").as_path()));
        assert_eq!(selector.best_score(), Some(0.5));
    }

    #[test]
    fn best_only_replaces_previous_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::BestOnly, MonitorMode::Min), dir.path())
                .unwrap();

        assert!(run(&mut selector, 0, 0.9).is_some());
        assert!(run(&mut selector, 1, 0.4).is_some());
        assert!(run(&mut selector, 2, 0.6).is_none());

        assert_eq!(files(dir.path()), ["epoch=01.ckpt"]);
        assert_eq!(selector.records().len(), 1);
        assert_eq!(selector.best_score(), Some(0.4));
    }

    #[test]
    fn top_k_evicts_worst_in_max_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::TopK(2), MonitorMode::Max), dir.path())
                .unwrap();

        run(&mut selector, 0, 0.2);
        run(&mut selector, 1, 0.8);
        run(&mut selector, 2, 0.5);
        assert!(run(&mut selector, 3, 0.1).is_none());

        assert_eq!(files(dir.path()), ["epoch=01.ckpt", "epoch=02.ckpt"]);
        assert_eq!(selector.best_model_path(), Some(dir.path().join("epoch=01.ckpt").as_path()));
    }

    #[test]
    fn ties_favor_the_newest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::EveryEpoch, MonitorMode::Min), dir.path())
                .unwrap();
        run(&mut selector, 0, 0.3);
        run(&mut selector, 1, 0.3);
        assert_eq!(selector.best_model_path(), Some(dir.path().join("epoch=01.ckpt").as_path()));

        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::BestOnly, MonitorMode::Min), dir.path())
                .unwrap();
        run(&mut selector, 0, 0.3);
        assert!(run(&mut selector, 1, 0.3).is_some());
        assert_eq!(files(dir.path()), ["epoch=01.ckpt"]);
    }

    #[test]
    fn missing_metric_skips_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::EveryEpoch, MonitorMode::Min), dir.path())
                .unwrap();
        let metrics: MetricMap = [(Metric::TrainLoss, 1.0)].into_iter().collect();

        let record = selector
            .on_validation_end(0, 4, &metrics, |_| panic!("no snapshot without the metric"))
            .unwrap();
        assert!(record.is_none());
        assert!(selector.best_model_path().is_none());
        assert!(files(dir.path()).is_empty());
    }

    #[test]
    fn nan_scores_rank_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::BestOnly, MonitorMode::Min), dir.path())
                .unwrap();
        run(&mut selector, 0, f64::NAN);
        run(&mut selector, 1, 5.0);
        assert!(run(&mut selector, 2, f64::NAN).is_none());
        assert_eq!(selector.best_model_path(), Some(dir.path().join("epoch=01.ckpt").as_path()));
    }

    #[test]
    fn untracked_file_gets_version_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("epoch=00.ckpt"), b"stale").unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::EveryEpoch, MonitorMode::Min), dir.path())
                .unwrap();

        let record = run(&mut selector, 0, 1.0).unwrap();
        assert_eq!(record.file_path, dir.path().join("epoch=00-v1.ckpt"));
        assert_eq!(fs::read(dir.path().join("epoch=00.ckpt")).unwrap(), b"stale");
    }

    #[test]
    fn every_n_epochs_and_save_last() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = CheckpointSelector::new(
            SelectorConfig {
                every_n_epochs: 2,
                save_last: true,
                ..config(SavePolicy::EveryEpoch, MonitorMode::Min)
            },
            dir.path(),
        )
        .unwrap();

        assert!(run(&mut selector, 0, 1.0).is_none());
        assert!(run(&mut selector, 1, 0.5).is_some());
        assert_eq!(files(dir.path()), ["epoch=01.ckpt", "last.ckpt"]);

        let last = load_trainer_state(&dir.path().join("last.ckpt")).unwrap();
        assert_eq!(last.epoch, 1);
    }

    #[test]
    fn failed_last_write_leaves_no_untracked_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = CheckpointSelector::new(
            SelectorConfig {
                save_last: true,
                ..config(SavePolicy::EveryEpoch, MonitorMode::Min)
            },
            dir.path(),
        )
        .unwrap();
        // A directory in the way makes the rename onto `last.ckpt` fail.
        fs::create_dir(dir.path().join("last.ckpt")).unwrap();

        let result = selector.on_validation_end(0, 4, &val_loss(1.0), |state| state_for(0, state));
        assert!(result.is_err());
        assert!(selector.records().is_empty());
        assert!(selector.best_model_path().is_none());
        assert_eq!(files(dir.path()), ["last.ckpt"]);

        fs::remove_dir(dir.path().join("last.ckpt")).unwrap();
        let record = run(&mut selector, 0, 1.0).unwrap();
        assert_eq!(record.file_path, dir.path().join("epoch=00.ckpt"));
    }

    #[test]
    fn saved_checkpoint_contains_its_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::EveryEpoch, MonitorMode::Min), dir.path())
                .unwrap();
        let record = run(&mut selector, 0, 0.25).unwrap();

        let state = load_trainer_state(&record.file_path).unwrap();
        let saved = state.selector.unwrap();
        assert_eq!(saved.records, vec![record.clone()]);
        assert_eq!(saved.best_model_path, Some(record.file_path));
        assert_eq!(saved, selector.state());
    }

    #[test]
    fn restored_state_keeps_ranking_and_drops_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector =
            CheckpointSelector::new(config(SavePolicy::TopK(2), MonitorMode::Min), dir.path())
                .unwrap();
        run(&mut selector, 0, 0.9);
        run(&mut selector, 1, 0.3);
        let state = selector.state();
        fs::remove_file(dir.path().join("epoch=01.ckpt")).unwrap();

        let mut resumed =
            CheckpointSelector::new(config(SavePolicy::TopK(2), MonitorMode::Min), dir.path())
                .unwrap();
        resumed.load_state(state.clone());
        assert_eq!(resumed.records().len(), 1);
        assert_eq!(resumed.best_model_path(), Some(dir.path().join("epoch=00.ckpt").as_path()));

        let mut switched =
            CheckpointSelector::new(config(SavePolicy::TopK(2), MonitorMode::Max), dir.path())
                .unwrap();
        switched.load_state(state);
        assert!(switched.records().is_empty());
        assert!(switched.best_model_path().is_none());
    }

    #[test]
    fn without_monitor_the_latest_checkpoint_is_best() {
        let dir = tempfile::tempdir().unwrap();
        let mut selector = CheckpointSelector::new(SelectorConfig::default(), dir.path()).unwrap();
        run(&mut selector, 0, 0.1);
        run(&mut selector, 1, 0.9);

        assert_eq!(files(dir.path()), ["epoch=1-step=8.ckpt"]);
        assert_eq!(
            selector.best_model_path(),
            Some(dir.path().join("epoch=1-step=8.ckpt").as_path())
        );
        assert_eq!(selector.best_score(), None);
    }

    #[test]
    fn invalid_configs_are_reported() {
        let config = SelectorConfig {
            every_n_epochs: 0,
            save_policy: SavePolicy::TopK(3),
            filename: Some("{epoch".into()),
            ..SelectorConfig::default()
        };
        assert_eq!(config.problems().len(), 3, "{:?}", config.problems());
        assert!(CheckpointSelector::new(config, "/tmp").is_err());
    }
}
