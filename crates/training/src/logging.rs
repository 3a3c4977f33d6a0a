use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    TrainingError,
};

/// Directory under the root directory that holds one `version_N` per run.
pub const LOG_DIR_NAME: &str = "lightning_logs";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    /// Resolves the run's log directory to the next free
    /// `{root}/lightning_logs/version_{N}`.
    pub fn from_config(config: &LoggingConfig, root_dir: &Path) -> Self {
        let tensorboard_dir = config
            .tensorboard
            .then(|| next_version_dir(&root_dir.join(LOG_DIR_NAME)));
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir,
            tensorboard_flush_every_n: config.flush_every_n.max(1),
        }
    }
}

/// First `version_N` under `dir` whose number is above every existing one.
pub fn next_version_dir(dir: &Path) -> PathBuf {
    let next = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_dir())
                .filter_map(|entry| {
                    entry
                        .file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix("version_"))
                        .and_then(|n| n.parse::<usize>().ok())
                })
                .max()
                .map_or(0, |max| max + 1)
        })
        .unwrap_or(0);
    dir.join(format!("version_{next}"))
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = if let Some(dir) = settings.tensorboard_dir.as_ref() {
            Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?)
        } else {
            None
        };
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.settings.tensorboard_dir.as_deref()
    }

    pub fn log_training_step(&mut self, epoch: usize, step: usize, lr: f64, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            println!(
                "train epoch={} step={} loss={:.6} samples/s={:.1} grad_norm={:.4} lr={:.5e}",
                epoch,
                step,
                snapshot.step_loss,
                snapshot.samples_per_sec,
                snapshot.raw_grad_norm,
                lr
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            let _ = writer.write_scalar("train/loss", step_i64, snapshot.step_loss);
            let _ = writer.write_scalar("train/loss_ema", step_i64, snapshot.loss);
            let _ = writer.write_scalar("train/grad_norm", step_i64, snapshot.raw_grad_norm);
            let _ = writer.write_scalar("train/learning_rate", step_i64, lr);
        }
    }

    /// Logs the end of a training epoch.
    pub fn log_epoch(&mut self, epoch: usize, step: usize, train_loss: Option<f64>) {
        if self.settings.enable_stdout {
            match train_loss {
                Some(loss) => println!("epoch {} done step={} train_loss={:.6}", epoch, step, loss),
                None => println!("epoch {} done step={}", epoch, step),
            }
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step_i64 = step as i64;
            let _ = writer.write_scalar("epoch", step_i64, epoch as f64);
            if let Some(loss) = train_loss {
                let _ = writer.write_scalar("train/epoch_loss", step_i64, loss);
            }
        }
    }

    pub fn log_validation(&mut self, epoch: usize, step: usize, summary: &EvaluationSummary) {
        self.log_evaluation("val", epoch, step, summary);
    }

    pub fn log_test(&mut self, epoch: usize, step: usize, summary: &EvaluationSummary) {
        self.log_evaluation("test", epoch, step, summary);
    }

    fn log_evaluation(
        &mut self,
        split: &str,
        epoch: usize,
        step: usize,
        summary: &EvaluationSummary,
    ) {
        if self.settings.enable_stdout {
            println!(
                "{} epoch={} step={} loss={:.6} batches={} samples={}",
                split, epoch, step, summary.average_loss, summary.batches, summary.samples
            );
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.write_scalar(&format!("{split}/loss"), step as i64, summary.average_loss);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

const FILE_VERSION: &str = "brain.Event:2";

/// Appends scalar summaries to a TensorBoard event file.
struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create log directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(format!(
            "events.out.tfevents.{}.{}",
            unix_time().as_secs(),
            hostname()
        ));
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create event file {}: {err}",
                path.display()
            ))
        })?;

        let mut writer = Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.append(&Event {
            wall_time: unix_time().as_secs_f64(),
            step: 0,
            file_version: Some(FILE_VERSION.to_string()),
            summary: None,
        })?;
        writer.flush()?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        self.append(&Event {
            wall_time: unix_time().as_secs_f64(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn append(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut payload = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut payload).map_err(|err| {
            TrainingError::runtime(format!("failed to encode event: {err}"))
        })?;
        self.writer
            .write_all(&frame_record(&payload))
            .map_err(|err| TrainingError::runtime(format!("failed to write event: {err}")))
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer
            .flush()
            .map_err(|err| TrainingError::runtime(format!("failed to flush event file: {err}")))?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// TFRecord framing: length, masked CRC of the length, payload, masked CRC of
/// the payload. All integers little endian.
fn frame_record(payload: &[u8]) -> Vec<u8> {
    let len = (payload.len() as u64).to_le_bytes();
    let mut record = Vec::with_capacity(payload.len() + 16);
    record.extend_from_slice(&len);
    record.extend_from_slice(&masked_crc32(&len).to_le_bytes());
    record.extend_from_slice(payload);
    record.extend_from_slice(&masked_crc32(payload).to_le_bytes());
    record
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_time() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

// Subset of tensorflow's event.proto and summary.proto.
#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
