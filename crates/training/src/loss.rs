use candle_core::Tensor;
use candle_nn::loss;

use crate::TrainingError;

/// Mean squared error over every prediction element.
#[derive(Debug, Clone, Default)]
pub struct MseLoss;

impl MseLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(
        &self,
        predictions: &Tensor,
        targets: &Tensor,
    ) -> Result<LossOutput, TrainingError> {
        if predictions.dims() != targets.dims() {
            return Err(TrainingError::runtime(format!(
                "predictions {:?} and targets {:?} must share a shape",
                predictions.dims(),
                targets.dims()
            )));
        }

        let rows = predictions.dims().first().copied().unwrap_or(0);
        let total_elements = predictions.elem_count();
        if total_elements == 0 {
            return Err(TrainingError::runtime(
                "no elements available for loss computation",
            ));
        }

        let targets = targets
            .to_device(predictions.device())
            .map_err(to_runtime_error)?;
        let average = loss::mse(predictions, &targets).map_err(to_runtime_error)?;
        let average_loss = average.to_vec0::<f32>().map_err(to_runtime_error)?;

        Ok(LossOutput {
            loss: average,
            metrics: LossMetrics {
                average_loss,
                rows,
                total_elements,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    rows: usize,
    total_elements: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn total_elements(&self) -> usize {
        self.total_elements
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
