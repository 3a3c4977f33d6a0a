use std::{collections::HashMap, path::Path};

use model::Model;
use tracing::info;

use super::{load_trainer_state, NamedTensor, TrainerState};
use crate::TrainingError;

/// Reads the checkpoint at `path` into a fresh [`TrainerState`].
///
/// A missing or undecodable file is a [`TrainingError::CorruptCheckpoint`].
/// Training continues at `state.epoch + 1`.
pub fn resume(path: impl AsRef<Path>) -> Result<TrainerState, TrainingError> {
    let path = path.as_ref();
    let state = load_trainer_state(path)?;
    info!(
        path = %path.display(),
        epoch = state.epoch,
        global_step = state.global_step,
        "loaded checkpoint"
    );
    Ok(state)
}

/// Copies checkpointed weights into the live model parameters. Every model
/// parameter must be present with a matching shape.
pub fn apply_model_weights(
    model: &Model,
    weights: &[NamedTensor],
    path: &Path,
) -> Result<(), TrainingError> {
    let by_name: HashMap<&str, &NamedTensor> = weights
        .iter()
        .map(|tensor| (tensor.name.as_str(), tensor))
        .collect();
    let parameters = model.parameters();
    if parameters.len() != by_name.len() {
        return Err(TrainingError::corrupt(
            path,
            format!(
                "checkpoint holds {} model tensors but the model has {} parameters",
                by_name.len(),
                parameters.len()
            ),
        ));
    }

    for (name, var) in parameters {
        let saved = by_name.get(name.as_str()).ok_or_else(|| {
            TrainingError::corrupt(path, format!("model parameter '{name}' is missing"))
        })?;
        if saved.shape.as_slice() != var.dims() {
            return Err(TrainingError::corrupt(
                path,
                format!(
                    "model parameter '{name}' has shape {:?} in the checkpoint but {:?} in the model",
                    saved.shape,
                    var.dims()
                ),
            ));
        }
        saved
            .to_tensor(var.device())
            .and_then(|tensor| tensor.to_dtype(var.dtype()))
            .and_then(|tensor| var.set(&tensor))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to restore parameter '{name}': {err}"))
            })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use model::{Activation, LinearInit, ModelConfig};

    fn tiny_model(seed: u64) -> Model {
        Model::new(ModelConfig {
            input_dim: 3,
            hidden_dims: vec![4],
            output_dim: 2,
            activation: Activation::Relu,
            init: LinearInit::KaimingUniform,
            bias: true,
            dtype: candle_core::DType::F32,
            device: Device::Cpu,
            seed,
        })
        .unwrap()
    }

    fn snapshot(model: &Model) -> Vec<NamedTensor> {
        model
            .parameters()
            .into_iter()
            .map(|(name, var)| NamedTensor::from_tensor(name, var.as_tensor()).unwrap())
            .collect()
    }

    #[test]
    fn weights_are_copied_into_the_model() {
        let source = tiny_model(1);
        let target = tiny_model(2);
        assert_ne!(snapshot(&source), snapshot(&target));

        apply_model_weights(&target, &snapshot(&source), Path::new("x.ckpt")).unwrap();
        assert_eq!(snapshot(&source), snapshot(&target));
    }

    #[test]
    fn shape_mismatch_is_corrupt() {
        let model = tiny_model(1);
        let mut weights = snapshot(&model);
        weights[0].shape = vec![weights[0].values.len()];

        let result = apply_model_weights(&model, &weights, Path::new("x.ckpt"));
        assert!(matches!(result, Err(TrainingError::CorruptCheckpoint { .. })));
    }

    #[test]
    fn missing_parameter_is_corrupt() {
        let model = tiny_model(1);
        let mut weights = snapshot(&model);
        weights.pop();

        let result = apply_model_weights(&model, &weights, Path::new("x.ckpt"));
        assert!(matches!(result, Err(TrainingError::CorruptCheckpoint { .. })));
    }

    #[test]
    fn resume_of_missing_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let result = resume(dir.path().join("epoch=00.ckpt"));
        assert!(matches!(result, Err(TrainingError::CorruptCheckpoint { .. })));
    }
}
