//! Single-file checkpoints holding everything needed to resume training.
//!
//! A checkpoint is a safetensors file. Model parameters are stored as
//! `model.<param>` tensors and optimizer buffers as `optimizer.<param>.<buffer>`.
//! The safetensors metadata carries a format tag, the format version and a JSON
//! [`CheckpointManifest`] with every scalar of the [`TrainerState`] plus a
//! SHA-256 digest of the tensor payload. Files are written to a hidden
//! temporary sibling first and renamed into place.

pub mod filename;
pub mod resume;
pub mod selector;

pub use filename::{parse_epoch, FilenameTemplate};
pub use resume::{apply_model_weights, resume};
pub use selector::{
    CheckpointRecord, CheckpointSelector, MonitorMode, SavePolicy, SelectorConfig, SelectorState,
};

use std::{
    borrow::Cow,
    collections::HashMap,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use safetensors::{tensor::TensorView, Dtype, SafeTensors, View};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::OptimizerType,
    optimizer::OptimizerState,
    scheduler::SchedulerState,
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_FORMAT: &str = "resumable-ckpt";
pub const CHECKPOINT_VERSION: u32 = 1;
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

const FORMAT_KEY: &str = "format";
const VERSION_KEY: &str = "version";
const MANIFEST_KEY: &str = "manifest";
const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Host copy of one f32 tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn from_tensor(name: impl Into<String>, tensor: &Tensor) -> candle_core::Result<Self> {
        let values = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            name: name.into(),
            shape: tensor.dims().to_vec(),
            values,
        })
    }

    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_vec(self.values.clone(), self.shape.as_slice(), device)
    }

    fn to_le_bytes(&self) -> Vec<u8> {
        self.values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect()
    }
}

/// Data-order randomness is derived from `(seed, epoch)`, so the seed is the
/// whole generator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngSnapshot {
    pub seed: u64,
}

/// Everything a resumed run needs to continue without discontinuity.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainerState {
    /// Last completed epoch.
    pub epoch: usize,
    pub global_step: usize,
    pub model_weights: Vec<NamedTensor>,
    pub optimizer: OptimizerState,
    pub scheduler: Option<SchedulerState>,
    pub selector: Option<SelectorState>,
    pub rng: RngSnapshot,
    pub config_sha256: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerManifest {
    pub algorithm: OptimizerType,
    pub step: usize,
    pub learning_rate: f64,
    pub buffers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    pub global_step: usize,
    pub model_tensors: Vec<String>,
    pub optimizer: OptimizerManifest,
    pub scheduler: Option<SchedulerState>,
    pub selector: Option<SelectorState>,
    pub rng: RngSnapshot,
    pub config_sha256: Option<String>,
    pub payload_sha256: String,
}

/// Serializes `state` into checkpoint bytes.
pub fn encode(state: &TrainerState) -> Result<Vec<u8>, TrainingError> {
    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        epoch: state.epoch,
        global_step: state.global_step,
        model_tensors: state.model_weights.iter().map(|t| t.name.clone()).collect(),
        optimizer: OptimizerManifest {
            algorithm: state.optimizer.algorithm,
            step: state.optimizer.step,
            learning_rate: state.optimizer.learning_rate,
            buffers: state.optimizer.buffers.iter().map(|t| t.name.clone()).collect(),
        },
        scheduler: state.scheduler.clone(),
        selector: state.selector.clone(),
        rng: state.rng,
        config_sha256: state.config_sha256.clone(),
        payload_sha256: payload_digest(
            state.model_weights.iter().chain(state.optimizer.buffers.iter()),
        ),
    };

    let manifest_json = serde_json::to_string(&manifest)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize manifest: {err}")))?;
    let metadata: HashMap<String, String> = [
        (FORMAT_KEY.to_string(), CHECKPOINT_FORMAT.to_string()),
        (VERSION_KEY.to_string(), CHECKPOINT_VERSION.to_string()),
        (MANIFEST_KEY.to_string(), manifest_json),
    ]
    .into_iter()
    .collect();

    let views = state
        .model_weights
        .iter()
        .map(|tensor| (format!("{MODEL_PREFIX}{}", tensor.name), F32View::new(tensor)))
        .chain(state.optimizer.buffers.iter().map(|tensor| {
            (
                format!("{OPTIMIZER_PREFIX}{}", tensor.name),
                F32View::new(tensor),
            )
        }));

    safetensors::tensor::serialize(views, &Some(metadata))
        .map_err(|err| TrainingError::runtime(format!("failed to serialize checkpoint: {err}")))
}

/// Parses checkpoint bytes. Every failure is reported as
/// [`TrainingError::CorruptCheckpoint`] against `path`.
pub fn decode(bytes: &[u8], path: &Path) -> Result<TrainerState, TrainingError> {
    let corrupt = |reason: String| TrainingError::corrupt(path, reason);

    let (_, metadata) = SafeTensors::read_metadata(bytes)
        .map_err(|err| corrupt(format!("unreadable header: {err}")))?;
    let info = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| corrupt("missing checkpoint metadata".into()))?;

    match info.get(FORMAT_KEY).map(String::as_str) {
        Some(CHECKPOINT_FORMAT) => {}
        Some(other) => return Err(corrupt(format!("unknown format tag '{other}'"))),
        None => return Err(corrupt("missing format tag".into())),
    }
    let version = info
        .get(VERSION_KEY)
        .and_then(|raw| raw.parse::<u32>().ok())
        .ok_or_else(|| corrupt("missing or malformed format version".into()))?;
    if version != CHECKPOINT_VERSION {
        return Err(corrupt(format!(
            "unsupported checkpoint version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    let manifest: CheckpointManifest = info
        .get(MANIFEST_KEY)
        .ok_or_else(|| corrupt("missing manifest".into()))
        .and_then(|raw| {
            serde_json::from_str(raw).map_err(|err| corrupt(format!("malformed manifest: {err}")))
        })?;

    let tensors = SafeTensors::deserialize(bytes)
        .map_err(|err| corrupt(format!("unreadable tensor payload: {err}")))?;
    let read = |prefix: &str, name: &str| -> Result<NamedTensor, TrainingError> {
        let key = format!("{prefix}{name}");
        let view = tensors
            .tensor(&key)
            .map_err(|err| corrupt(format!("tensor '{key}': {err}")))?;
        named_from_view(name, &view).map_err(|reason| corrupt(format!("tensor '{key}': {reason}")))
    };

    let model_weights = manifest
        .model_tensors
        .iter()
        .map(|name| read(MODEL_PREFIX, name))
        .collect::<Result<Vec<_>, _>>()?;
    let buffers = manifest
        .optimizer
        .buffers
        .iter()
        .map(|name| read(OPTIMIZER_PREFIX, name))
        .collect::<Result<Vec<_>, _>>()?;

    let expected_tensors = model_weights.len() + buffers.len();
    if tensors.len() != expected_tensors {
        return Err(corrupt(format!(
            "payload holds {} tensors but the manifest lists {}",
            tensors.len(),
            expected_tensors
        )));
    }

    let digest = payload_digest(model_weights.iter().chain(buffers.iter()));
    if digest != manifest.payload_sha256 {
        return Err(corrupt("tensor payload failed checksum validation".into()));
    }

    Ok(TrainerState {
        epoch: manifest.epoch,
        global_step: manifest.global_step,
        model_weights,
        optimizer: OptimizerState {
            algorithm: manifest.optimizer.algorithm,
            step: manifest.optimizer.step,
            learning_rate: manifest.optimizer.learning_rate,
            buffers,
        },
        scheduler: manifest.scheduler,
        selector: manifest.selector,
        rng: manifest.rng,
        config_sha256: manifest.config_sha256,
    })
}

/// Writes `state` to `path` through a temporary sibling and an atomic rename.
pub fn save_trainer_state(path: &Path, state: &TrainerState) -> Result<(), TrainingError> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            parent.display()
        ))
    })?;

    let bytes = encode(state)?;
    let tmp_path = temporary_path(path);
    let written = File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp_path, path));

    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(TrainingError::runtime(format!(
            "failed to write checkpoint {}: {err}",
            path.display()
        )));
    }
    Ok(())
}

/// Reads and validates the checkpoint at `path`.
pub fn load_trainer_state(path: &Path) -> Result<TrainerState, TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::corrupt(path, "checkpoint file does not exist"));
    }
    let bytes = fs::read(path)
        .map_err(|err| TrainingError::corrupt(path, format!("failed to read file: {err}")))?;
    decode(&bytes, path)
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn payload_digest<'a>(tensors: impl Iterator<Item = &'a NamedTensor>) -> String {
    let mut hasher = Sha256::new();
    for tensor in tensors {
        hasher.update(tensor.name.as_bytes());
        hasher.update([0u8]);
        for dim in &tensor.shape {
            hasher.update((*dim as u64).to_le_bytes());
        }
        hasher.update(tensor.to_le_bytes());
    }
    hex_encode(hasher.finalize())
}

fn named_from_view(name: &str, view: &TensorView<'_>) -> Result<NamedTensor, String> {
    if view.dtype() != Dtype::F32 {
        return Err(format!("expected F32 data, found {:?}", view.dtype()));
    }
    let data = view.data();
    let expected = view.shape().iter().product::<usize>() * 4;
    if data.len() != expected {
        return Err(format!(
            "expected {} bytes for shape {:?}, found {}",
            expected,
            view.shape(),
            data.len()
        ));
    }
    let values = data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(NamedTensor {
        name: name.to_string(),
        shape: view.shape().to_vec(),
        values,
    })
}

fn temporary_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct F32View<'a> {
    tensor: &'a NamedTensor,
    bytes: Vec<u8>,
}

impl<'a> F32View<'a> {
    fn new(tensor: &'a NamedTensor) -> Self {
        Self {
            tensor,
            bytes: tensor.to_le_bytes(),
        }
    }
}

impl View for F32View<'_> {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.tensor.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}
