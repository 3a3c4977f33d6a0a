use candle_core::{Error, Result, Tensor, Var};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    config::ModelConfig,
    linear::{Linear, LinearConfig},
};

/// Feed-forward regressor assembled from [`Linear`] projections.
pub struct Model {
    config: ModelConfig,
    layers: Vec<Linear>,
}

impl Model {
    /// Builds the model according to `config`, drawing weights from `config.seed`.
    pub fn new(config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);

        let mut layers = Vec::with_capacity(config.hidden_dims.len() + 1);
        for (input_dim, output_dim) in config.layer_dims() {
            let layer_cfg = LinearConfig {
                input_dim,
                output_dim,
                bias: config.bias,
            };
            layers.push(Linear::with_init(
                layer_cfg,
                &config.init,
                &mut rng,
                &config.device,
            )?);
        }

        Ok(Self { config, layers })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Produces predictions shaped `(rows, output_dim)` for `(rows, input_dim)` features.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let last = self
            .layers
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::Msg("model has no layers".into()))?;

        let mut hidden = features.clone();
        for (idx, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden)?;
            if idx != last {
                hidden = self.config.activation.apply(&hidden)?;
            }
        }
        Ok(hidden)
    }

    /// Trainable parameters in forward order, named `layers.{idx}.weight|bias`.
    pub fn parameters(&self) -> Vec<(String, Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(idx, layer)| layer.parameters(&format!("layers.{idx}")))
            .collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}
