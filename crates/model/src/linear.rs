//! Affine projection whose parameters are trainable [`Var`]s.
//!
//! Linear layers accept inputs shaped `(rows, in_dim)` or `(batch, seq, in_dim)`
//! and return the same leading dimensions with `out_dim` features. Weights are
//! stored `(out_dim, in_dim)` like the usual framework convention so that named
//! parameters line up with checkpoints produced elsewhere. Initialisation draws
//! from a caller supplied RNG, which keeps construction reproducible under a
//! fixed seed.

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Static shape of a dense projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearInit {
    /// Uniform in `±1/sqrt(fan_in)`, the default for dense layers in most frameworks.
    #[default]
    LecunUniform,
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation with ReLU gain.
    KaimingUniform,
    /// Kaiming/He normal initialisation with ReLU gain.
    KaimingNormal,
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), rng: &mut StdRng) -> Result<Vec<f32>> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let count = out_dim * in_dim;
        let values = match self {
            LinearInit::LecunUniform => uniform(count, 1.0 / fan_in.sqrt(), rng),
            LinearInit::XavierUniform => uniform(count, (6.0 / (fan_in + fan_out)).sqrt(), rng),
            LinearInit::XavierNormal => normal(count, (2.0 / (fan_in + fan_out)).sqrt(), rng)?,
            LinearInit::KaimingUniform => uniform(count, (6.0 / fan_in).sqrt(), rng),
            LinearInit::KaimingNormal => normal(count, (2.0 / fan_in).sqrt(), rng)?,
        };
        Ok(values)
    }
}

fn uniform(count: usize, bound: f64, rng: &mut StdRng) -> Vec<f32> {
    let bound = bound as f32;
    (0..count).map(|_| rng.gen_range(-bound..=bound)).collect()
}

fn normal(count: usize, std: f64, rng: &mut StdRng) -> Result<Vec<f32>> {
    let dist = Normal::new(0f32, std as f32).map_err(|err| Error::Msg(err.to_string()))?;
    Ok((0..count).map(|_| dist.sample(rng)).collect())
}

/// Dense affine projection `y = x W^T + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
        })
    }

    /// Builds a linear layer with weights drawn from `init`; biases start at zero.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let shape = (config.output_dim, config.input_dim);
        let values = init.sample(shape, rng)?;
        let weight = Tensor::from_vec(values, shape, device)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, DType::F32, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var> {
        self.bias.as_ref()
    }

    /// Named trainable parameters, `{prefix}.weight` then `{prefix}.bias`.
    pub fn parameters(&self, prefix: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{prefix}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{prefix}.bias"), bias.clone()));
        }
        params
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.validate_input(hidden)?;
        let weight_t = self.weight.as_tensor().t()?;

        let mut output = match hidden.dims() {
            [batch, seq, _] => {
                let flat = hidden.reshape((*batch * *seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((*batch, *seq, self.config.output_dim))?
            }
            [_, _] => hidden.matmul(&weight_t)?,
            _ => unreachable!("validated above"),
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias.as_tensor())?;
        }
        Ok(output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        let expected = [config.output_dim, config.input_dim];
        if weight.dims() != expected {
            return Err(Error::Msg(format!(
                "linear.weight expected shape {:?} but received {:?}",
                expected,
                weight.dims()
            )));
        }
        if weight.dtype() != DType::F32 {
            return Err(Error::Msg(format!(
                "linear.weight must be f32 (got {:?})",
                weight.dtype()
            )));
        }
        Ok(())
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                if tensor.dims() != [config.output_dim] {
                    return Err(Error::Msg(format!(
                        "linear.bias expected shape [{}] but received {:?}",
                        config.output_dim,
                        tensor.dims()
                    )));
                }
                Ok(())
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [.., hidden_dim] if hidden.rank() == 2 || hidden.rank() == 3 => {
                if *hidden_dim != self.config.input_dim {
                    Err(Error::Msg(format!(
                        "expected last dim {} but received {}",
                        self.config.input_dim, hidden_dim
                    )))
                } else {
                    Ok(())
                }
            }
            _ => Err(Error::Msg(
                "linear expects input shaped [B, T, H_in] or [N, H_in]".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn forward_matches_manual_affine() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 2.0], [0.5, -1.0], [0.0, 3.0]], &device)?;
        let bias = Tensor::new(&[0.1f32, 0.2, 0.3], &device)?;
        let linear = Linear::new(LinearConfig::new(2, 3), weight, Some(bias))?;

        let input = Tensor::new(&[[1f32, 1.0]], &device)?;
        let output = linear.forward(&input)?.to_vec2::<f32>()?;

        let expected = [3.1f32, -0.3, 3.3];
        for (got, want) in output[0].iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
        Ok(())
    }

    #[test]
    fn lecun_bounds_hold() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let values = LinearInit::LecunUniform.sample((4, 16), &mut rng)?;
        assert_eq!(values.len(), 64);
        assert!(values.iter().all(|v| v.abs() <= 0.25));
        Ok(())
    }

    #[test]
    fn rejects_wrong_input_width() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        let linear = Linear::with_init(
            LinearConfig::new(4, 2),
            &LinearInit::XavierUniform,
            &mut rng,
            &Device::Cpu,
        )?;
        let input = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        assert!(linear.forward(&input).is_err());
        Ok(())
    }
}
