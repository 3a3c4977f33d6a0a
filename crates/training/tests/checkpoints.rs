use std::{collections::BTreeSet, fs, path::Path};

use tempfile::tempdir;
use training::{
    checkpoint::load_trainer_state,
    config::{BatchLimit, LoggingConfig},
    Metric, MonitorMode, RunContext, SavePolicy, SelectorConfig, Trainer, TrainerStatus,
    TrainingConfig, TrainingError,
};

fn base_config(root: &Path, max_epochs: usize, checkpoint: SelectorConfig) -> TrainingConfig {
    let mut config = TrainingConfig::default();
    config.model.input_dim = 4;
    config.data.input_dim = 4;
    config.data.train_samples = 16;
    config.data.val_samples = 16;
    config.data.test_samples = 16;
    config.optimizer.learning_rate = 0.01;
    config.runtime.default_root_dir = root.to_path_buf();
    config.runtime.max_epochs = max_epochs;
    config.runtime.limit_train_batches = Some(BatchLimit::Count(12));
    config.runtime.logging = LoggingConfig {
        enable_stdout: false,
        tensorboard: false,
        flush_every_n: 1,
    };
    config.runtime.checkpoint = SelectorConfig {
        dirpath: Some(root.to_path_buf()),
        filename: Some("{epoch:02d}".into()),
        ..checkpoint
    };
    config
}

fn monitored(save_policy: SavePolicy) -> SelectorConfig {
    SelectorConfig {
        monitor: Some(Metric::ValLoss),
        mode: MonitorMode::Min,
        save_policy,
        ..SelectorConfig::default()
    }
}

fn entries(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn assert_fit_fails_as_corrupt(root: &Path, checkpoint: &Path) {
    let mut config = base_config(root, 2, monitored(SavePolicy::EveryEpoch));
    config.runtime.resume_from_checkpoint = Some(checkpoint.to_path_buf());
    let mut trainer = Trainer::new(config, RunContext::new(1)).unwrap();

    match trainer.fit() {
        Err(TrainingError::CorruptCheckpoint { path, .. }) => assert_eq!(path, checkpoint),
        other => panic!("expected a corrupt checkpoint error, got {other:?}"),
    }
    assert_eq!(trainer.status(), TrainerStatus::NotStarted);
    assert_eq!(trainer.global_step(), 0);
}

#[test]
fn missing_resume_file_aborts_fit() {
    let tmp = tempdir().unwrap();
    assert_fit_fails_as_corrupt(tmp.path(), &tmp.path().join("epoch=07.ckpt"));
}

#[test]
fn garbage_resume_file_aborts_fit() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("epoch=00.ckpt");
    fs::write(&path, b"definitely not a checkpoint").unwrap();
    assert_fit_fails_as_corrupt(tmp.path(), &path);
}

#[test]
fn truncated_checkpoint_aborts_fit() {
    let source = tempdir().unwrap();
    let mut trainer = Trainer::new(
        base_config(source.path(), 1, monitored(SavePolicy::EveryEpoch)),
        RunContext::new(1),
    )
    .unwrap();
    trainer.fit().unwrap();
    let saved = source.path().join("epoch=00.ckpt");
    let bytes = fs::read(&saved).unwrap();
    fs::write(&saved, &bytes[..bytes.len() - 3]).unwrap();

    let target = tempdir().unwrap();
    assert_fit_fails_as_corrupt(target.path(), &saved);
}

#[test]
fn checkpoint_from_a_different_model_is_rejected() {
    let source = tempdir().unwrap();
    let mut config = base_config(source.path(), 1, monitored(SavePolicy::EveryEpoch));
    config.model.hidden_dims = vec![3];
    Trainer::new(config, RunContext::new(1))
        .unwrap()
        .fit()
        .unwrap();

    let target = tempdir().unwrap();
    assert_fit_fails_as_corrupt(target.path(), &source.path().join("epoch=00.ckpt"));
}

#[test]
fn top_k_keeps_the_best_files_on_disk() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        base_config(tmp.path(), 4, monitored(SavePolicy::TopK(2))),
        RunContext::new(5),
    )
    .unwrap();
    trainer.fit().unwrap();

    let records = trainer.selector().records();
    assert_eq!(records.len(), 2);
    let kept: BTreeSet<String> = records
        .iter()
        .map(|record| record.file_path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let ckpts: BTreeSet<String> = entries(tmp.path())
        .into_iter()
        .filter(|name| name.ends_with(".ckpt"))
        .collect();
    assert_eq!(kept, ckpts);

    let best = trainer.best_model_path().unwrap();
    let best_score = trainer.selector().best_score().unwrap();
    assert!(records
        .iter()
        .all(|record| record.metric_value.unwrap() >= best_score));
    let state = load_trainer_state(best).unwrap();
    assert_eq!(
        state.selector.unwrap().records.len(),
        2.min(state.epoch + 1)
    );
}

#[test]
fn best_only_keeps_a_single_file() {
    let tmp = tempdir().unwrap();
    let mut trainer = Trainer::new(
        base_config(tmp.path(), 3, monitored(SavePolicy::BestOnly)),
        RunContext::new(5),
    )
    .unwrap();
    trainer.fit().unwrap();

    let ckpts: Vec<String> = entries(tmp.path())
        .into_iter()
        .filter(|name| name.ends_with(".ckpt"))
        .collect();
    assert_eq!(ckpts.len(), 1);
    assert_eq!(
        trainer.best_model_path().unwrap(),
        tmp.path().join(&ckpts[0]).as_path()
    );
}

#[test]
fn missing_monitor_metric_skips_checkpoints() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 2, monitored(SavePolicy::EveryEpoch));
    config.data.val_samples = 0;

    let mut trainer = Trainer::new(config, RunContext::new(1)).unwrap();
    trainer.fit().unwrap();

    assert_eq!(trainer.status(), TrainerStatus::Finished);
    assert!(trainer.best_model_path().is_none());
    assert!(entries(tmp.path()).is_empty());
}

#[test]
fn disabled_validation_still_checkpoints_every_epoch() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 2, SelectorConfig::default());
    config.runtime.limit_val_batches = Some(BatchLimit::Count(0));

    let mut trainer = Trainer::new(config, RunContext::new(1)).unwrap();
    trainer.fit().unwrap();

    assert_eq!(trainer.status(), TrainerStatus::Finished);
    assert_eq!(
        trainer.best_model_path(),
        Some(tmp.path().join("epoch=01.ckpt").as_path())
    );
    assert_eq!(
        entries(tmp.path()),
        ["epoch=01.ckpt".to_string()].into_iter().collect()
    );
}

#[test]
fn disabled_validation_skips_monitored_checkpoints() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 2, monitored(SavePolicy::EveryEpoch));
    config.runtime.limit_val_batches = Some(BatchLimit::Fraction(0.01));

    let mut trainer = Trainer::new(config, RunContext::new(1)).unwrap();
    trainer.fit().unwrap();

    assert_eq!(trainer.status(), TrainerStatus::Finished);
    assert!(trainer.best_model_path().is_none());
    assert!(entries(tmp.path()).is_empty());
}

#[test]
fn trainer_state_requires_a_completed_epoch() {
    let tmp = tempdir().unwrap();
    let trainer = Trainer::new(
        base_config(tmp.path(), 1, monitored(SavePolicy::EveryEpoch)),
        RunContext::new(1),
    )
    .unwrap();
    assert!(matches!(
        trainer.trainer_state(),
        Err(TrainingError::Runtime(_))
    ));
}

#[test]
fn unmonitored_selector_keeps_the_latest_checkpoint() {
    let tmp = tempdir().unwrap();
    let mut config = base_config(tmp.path(), 3, SelectorConfig::default());
    config.runtime.checkpoint.filename = None;

    let mut trainer = Trainer::new(config, RunContext::new(1)).unwrap();
    trainer.fit().unwrap();

    assert_eq!(
        entries(tmp.path()),
        ["epoch=2-step=36.ckpt".to_string()].into_iter().collect()
    );
}
