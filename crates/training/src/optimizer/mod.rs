use std::collections::{BTreeMap, HashMap};

use candle_core::{backprop::GradStore, Tensor, Var};

use crate::{
    checkpoint::NamedTensor,
    config::{self, OptimizerType},
    TrainingError,
};

const EPS: f64 = 1e-12;

const MOMENTUM_BUFFER: &str = "momentum_buffer";
const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

#[derive(Debug, Clone, Copy)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    AdamW(AdamWConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub nesterov: bool,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl OptimizerConfig {
    pub fn kind(&self) -> OptimizerType {
        match self {
            OptimizerConfig::Sgd(_) => OptimizerType::Sgd,
            OptimizerConfig::AdamW(_) => OptimizerType::AdamW,
        }
    }
}

impl From<&config::OptimizerConfig> for OptimizerConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        match value.algorithm {
            OptimizerType::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.learning_rate,
                momentum: value.momentum,
                dampening: value.dampening,
                nesterov: value.nesterov,
                weight_decay: value.weight_decay,
            }),
            OptimizerType::AdamW => OptimizerConfig::AdamW(AdamWConfig {
                learning_rate: value.learning_rate,
                beta1: value.beta1,
                beta2: value.beta2,
                epsilon: value.epsilon,
                weight_decay: value.weight_decay,
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
}

/// Serializable optimizer state; buffers are named `{parameter}.{buffer}`.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerState {
    pub algorithm: OptimizerType,
    pub step: usize,
    pub learning_rate: f64,
    pub buffers: Vec<NamedTensor>,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    buffers: BTreeMap<&'static str, Tensor>,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            if !var.as_tensor().dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            params.push(ParameterSlot {
                name,
                param: var,
                buffers: BTreeMap::new(),
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn algorithm(&self) -> OptimizerType {
        self.config.kind()
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        match self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    /// Applies one update from `grads` and returns the pre-clipping global
    /// gradient norm. Parameters without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            if let Some(grad) = grads.get(slot.param.as_tensor()) {
                let norm_sq = tensor_sq_sum(grad)?;
                processed.push(ProcessedGradient {
                    index: idx,
                    grad: grad.clone(),
                    norm_sq,
                });
            }
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm = processed.iter().map(|g| g.norm_sq).sum::<f64>().sqrt();
        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        match self.config {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed)?,
            OptimizerConfig::AdamW(cfg) => self.step_adamw(cfg, processed)?,
        }

        Ok(total_norm)
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let param = slot.param.as_tensor();

            let mut direction = if cfg.weight_decay != 0.0 {
                let decay = param
                    .affine(cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?;
                item.grad.add(&decay).map_err(to_runtime_error)?
            } else {
                item.grad
            };

            if cfg.momentum != 0.0 {
                let buffer = match slot.buffers.get(MOMENTUM_BUFFER) {
                    None => direction.clone(),
                    Some(prev) => {
                        let carried = prev.affine(cfg.momentum, 0.0).map_err(to_runtime_error)?;
                        let fresh = direction
                            .affine(1.0 - cfg.dampening, 0.0)
                            .map_err(to_runtime_error)?;
                        carried.add(&fresh).map_err(to_runtime_error)?
                    }
                };
                direction = if cfg.nesterov {
                    let lookahead = buffer.affine(cfg.momentum, 0.0).map_err(to_runtime_error)?;
                    direction.add(&lookahead).map_err(to_runtime_error)?
                } else {
                    buffer.clone()
                };
                slot.buffers.insert(MOMENTUM_BUFFER, buffer);
            }

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = param.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn step_adamw(
        &mut self,
        cfg: AdamWConfig,
        processed: Vec<ProcessedGradient>,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];
            let param = slot.param.as_tensor();

            let grad_term = item
                .grad
                .affine(1.0 - cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = match slot.buffers.get(EXP_AVG) {
                Some(prev) => prev
                    .affine(cfg.beta1, 0.0)
                    .and_then(|prev| prev.add(&grad_term))
                    .map_err(to_runtime_error)?,
                None => grad_term,
            };

            let grad_sq_term = item
                .grad
                .sqr()
                .and_then(|sq| sq.affine(1.0 - cfg.beta2, 0.0))
                .map_err(to_runtime_error)?;
            let new_v = match slot.buffers.get(EXP_AVG_SQ) {
                Some(prev) => prev
                    .affine(cfg.beta2, 0.0)
                    .and_then(|prev| prev.add(&grad_sq_term))
                    .map_err(to_runtime_error)?,
                None => grad_sq_term,
            };

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let denom = new_v
                .affine(scale_v, 0.0)
                .and_then(|v_hat| v_hat.sqrt())
                .and_then(|root| root.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|ratio| ratio.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let decayed = if cfg.weight_decay != 0.0 {
                param
                    .affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                param.clone()
            };

            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;

            slot.buffers.insert(EXP_AVG, new_m);
            slot.buffers.insert(EXP_AVG_SQ, new_v);
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut buffers = Vec::new();
        for slot in &self.params {
            for (buffer, tensor) in &slot.buffers {
                let name = format!("{}.{}", slot.name, buffer);
                buffers.push(NamedTensor::from_tensor(name, tensor).map_err(to_runtime_error)?);
            }
        }

        Ok(OptimizerState {
            algorithm: self.config.kind(),
            step: self.step,
            learning_rate: self.learning_rate(),
            buffers,
        })
    }

    /// Replaces step counter, learning rate and every buffer with `state`.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        if state.algorithm != self.config.kind() {
            return Err(TrainingError::runtime(format!(
                "optimizer state was produced by {:?} but the optimizer is {:?}",
                state.algorithm,
                self.config.kind()
            )));
        }

        let index: HashMap<String, usize> = self
            .params
            .iter()
            .enumerate()
            .map(|(idx, slot)| (slot.name.clone(), idx))
            .collect();

        let mut restored: Vec<BTreeMap<&'static str, Tensor>> =
            vec![BTreeMap::new(); self.params.len()];
        for named in state.buffers {
            let (param_name, buffer_name) = named.name.rsplit_once('.').ok_or_else(|| {
                TrainingError::runtime(format!("malformed optimizer buffer name '{}'", named.name))
            })?;
            let buffer = known_buffer(buffer_name).ok_or_else(|| {
                TrainingError::runtime(format!("unknown optimizer buffer '{}'", named.name))
            })?;
            let idx = *index.get(param_name).ok_or_else(|| {
                TrainingError::runtime(format!(
                    "optimizer state references unknown parameter '{}'",
                    param_name
                ))
            })?;

            let param = self.params[idx].param.as_tensor();
            if param.dims() != named.shape.as_slice() {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': expected {:?}, found {:?}",
                    named.name,
                    param.dims(),
                    named.shape
                )));
            }
            let tensor = named.to_tensor(param.device()).map_err(to_runtime_error)?;
            restored[idx].insert(buffer, tensor);
        }

        for (slot, buffers) in self.params.iter_mut().zip(restored) {
            slot.buffers = buffers;
        }
        self.step = state.step;
        self.set_learning_rate(state.learning_rate);
        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm_sq: f64,
}

fn known_buffer(name: &str) -> Option<&'static str> {
    [MOMENTUM_BUFFER, EXP_AVG, EXP_AVG_SQ]
        .into_iter()
        .find(|known| *known == name)
}

fn tensor_sq_sum(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .and_then(|sq| sq.sum_all())
        .and_then(|sum| sum.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(squared as f64)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sgd(momentum: f64, nesterov: bool) -> OptimizerConfig {
        OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.1,
            momentum,
            dampening: 0.0,
            nesterov,
            weight_decay: 0.0,
        })
    }

    fn quadratic_step(optimizer: &mut TrainerOptimizer, var: &Var) -> f64 {
        // d/dw sum(w^2) = 2w
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        optimizer.step(&grads).unwrap()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn plain_sgd_matches_closed_form() {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            sgd(0.0, false),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();

        let norm = quadratic_step(&mut optimizer, &var);

        assert!((norm - (4.0f64 + 16.0).sqrt()).abs() < 1e-5);
        let updated = values(&var);
        assert!((updated[0] - 0.8).abs() < 1e-6);
        assert!((updated[1] + 1.6).abs() < 1e-6);
        assert!(optimizer.state().unwrap().buffers.is_empty());
    }

    #[test]
    fn momentum_buffer_accumulates() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            sgd(0.9, false),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();

        quadratic_step(&mut optimizer, &var);
        // buf = 2.0, w = 1 - 0.2
        assert!((values(&var)[0] - 0.8).abs() < 1e-6);
        quadratic_step(&mut optimizer, &var);
        // buf = 0.9 * 2 + 1.6 = 3.4, w = 0.8 - 0.34
        assert!((values(&var)[0] - 0.46).abs() < 1e-6);

        let state = optimizer.state().unwrap();
        assert_eq!(state.step, 2);
        assert_eq!(state.buffers.len(), 1);
        assert_eq!(state.buffers[0].name, "w.momentum_buffer");
        assert!((state.buffers[0].values[0] - 3.4).abs() < 1e-6);
    }

    #[test]
    fn global_norm_clipping_scales_update() {
        let var = Var::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            sgd(0.0, false),
            TrainerOptimizerOptions {
                clip_global_norm: Some(1.0),
            },
        )
        .unwrap();

        let norm = quadratic_step(&mut optimizer, &var);
        assert!((norm - 10.0).abs() < 1e-5);
        let updated = values(&var);
        assert!((updated[0] - (3.0 - 0.1 * 0.6)).abs() < 1e-5);
        assert!((updated[1] - (4.0 - 0.1 * 0.8)).abs() < 1e-5);
    }

    #[test]
    fn state_round_trip_continues_identically() {
        let build = |var: &Var| {
            TrainerOptimizer::new(
                vec![("w".to_string(), var.clone())],
                OptimizerConfig::AdamW(AdamWConfig {
                    learning_rate: 0.01,
                    beta1: 0.9,
                    beta2: 0.999,
                    epsilon: 1e-8,
                    weight_decay: 0.01,
                }),
                TrainerOptimizerOptions::default(),
            )
            .unwrap()
        };

        let original = Var::new(&[0.5f32, -1.5, 2.0], &Device::Cpu).unwrap();
        let mut first = build(&original);
        quadratic_step(&mut first, &original);
        quadratic_step(&mut first, &original);
        let state = first.state().unwrap();

        let copy = Var::from_tensor(&original.as_tensor().copy().unwrap()).unwrap();
        let mut second = build(&copy);
        second.load_state(state.clone()).unwrap();
        assert_eq!(second.state().unwrap(), state);
        assert_eq!(second.steps(), 2);

        quadratic_step(&mut first, &original);
        quadratic_step(&mut second, &copy);
        assert_eq!(values(&original), values(&copy));
    }

    #[test]
    fn load_rejects_foreign_algorithm_and_shapes() {
        let var = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var)],
            sgd(0.9, false),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        assert_eq!(optimizer.algorithm(), OptimizerType::Sgd);

        let wrong_shape = OptimizerState {
            algorithm: OptimizerType::Sgd,
            step: 1,
            learning_rate: 0.1,
            buffers: vec![NamedTensor {
                name: "w.momentum_buffer".into(),
                shape: vec![3],
                values: vec![0.0; 3],
            }],
        };
        assert!(optimizer.load_state(wrong_shape).is_err());

        let wrong_algorithm = OptimizerState {
            algorithm: OptimizerType::AdamW,
            step: 1,
            learning_rate: 0.1,
            buffers: Vec::new(),
        };
        assert!(optimizer.load_state(wrong_algorithm).is_err());
    }
}
