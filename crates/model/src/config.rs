use candle_core::{DType, Device, Error, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::linear::LinearInit;

/// Non-linearity applied between hidden projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Gelu,
    Tanh,
}

impl Activation {
    pub fn apply(&self, hidden: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Relu => hidden.relu(),
            Activation::Gelu => hidden.gelu(),
            Activation::Tanh => hidden.tanh(),
        }
    }
}

/// Configuration for assembling the multilayer perceptron.
///
/// An empty `hidden_dims` yields a single affine projection from
/// `input_dim` to `output_dim`.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub input_dim: usize,
    pub hidden_dims: Vec<usize>,
    pub output_dim: usize,
    pub activation: Activation,
    pub init: LinearInit,
    pub bias: bool,
    pub dtype: DType,
    pub device: Device,
    /// Seed for parameter initialisation; identical seeds give identical weights.
    pub seed: u64,
}

impl ModelConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_dims: Vec::new(),
            output_dim,
            activation: Activation::default(),
            init: LinearInit::default(),
            bias: true,
            dtype: DType::F32,
            device: Device::Cpu,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Msg("input_dim must be greater than zero".into()));
        }
        if self.output_dim == 0 {
            return Err(Error::Msg("output_dim must be greater than zero".into()));
        }
        if let Some(position) = self.hidden_dims.iter().position(|&dim| dim == 0) {
            return Err(Error::Msg(format!(
                "hidden_dims[{position}] must be greater than zero"
            )));
        }
        if self.dtype != DType::F32 {
            return Err(Error::Msg(format!(
                "only f32 parameters are supported (got {:?})",
                self.dtype
            )));
        }
        Ok(())
    }

    /// `(input, output)` widths of every projection, in forward order.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut widths = Vec::with_capacity(self.hidden_dims.len() + 2);
        widths.push(self.input_dim);
        widths.extend(self.hidden_dims.iter().copied());
        widths.push(self.output_dim);
        widths.windows(2).map(|pair| (pair[0], pair[1])).collect()
    }
}
