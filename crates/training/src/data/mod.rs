use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand_distr::{Distribution, StandardNormal};

use crate::{
    context::{DataSplit, RunContext},
    TrainingError,
};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Batch returned by dataset loaders.
#[derive(Debug)]
pub struct DataBatch {
    /// `(rows, input_dim)` features.
    pub features: Tensor,
    /// `(rows, output_dim)` regression targets.
    pub targets: Tensor,
    pub rows: usize,
    pub batch_index: usize,
    pub epoch: usize,
}

/// Fixed set of standard-normal feature rows with a constant target.
///
/// Samples are drawn once from the run's seed, so every epoch (and every
/// resumed run with the same seed) sees identical rows.
#[derive(Debug, Clone)]
pub struct RandomDataset {
    split: DataSplit,
    input_dim: usize,
    output_dim: usize,
    target_value: f32,
    features: Vec<f32>,
}

impl RandomDataset {
    pub fn generate(
        split: DataSplit,
        samples: usize,
        input_dim: usize,
        output_dim: usize,
        target_value: f32,
        context: &RunContext,
    ) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TrainingError::initialization(format!(
                "{} dataset requires non-zero input and output widths",
                split.as_str()
            )));
        }

        let mut rng = context.data_rng(split);
        let features: Vec<f32> = (0..samples * input_dim)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();

        Ok(Self {
            split,
            input_dim,
            output_dim,
            target_value,
            features,
        })
    }

    pub fn split(&self) -> DataSplit {
        self.split
    }

    pub fn len(&self) -> usize {
        self.features.len() / self.input_dim
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.input_dim;
        &self.features[start..start + self.input_dim]
    }
}

/// Splits a [`RandomDataset`] into batches, optionally reshuffled per epoch.
///
/// The final batch of an epoch may be short; it is never dropped.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: RandomDataset,
    batch_size: usize,
    shuffle: bool,
    device: Device,
}

impl DataLoader {
    pub fn new(
        dataset: RandomDataset,
        batch_size: usize,
        shuffle: bool,
        device: Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset,
            batch_size,
            shuffle,
            device,
        })
    }

    pub fn dataset(&self) -> &RandomDataset {
        &self.dataset
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Row order for `epoch`; identity unless shuffling is enabled.
    pub fn order(&self, epoch: usize, context: &RunContext) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut context.shuffle_rng(epoch));
        }
        order
    }

    /// Batches of `epoch`, truncated to `limit` batches.
    pub fn epoch<'a>(
        &'a self,
        epoch: usize,
        limit: usize,
        context: &RunContext,
    ) -> impl Iterator<Item = Result<DataBatch>> + 'a {
        let order = self.order(epoch, context);
        let batches = self.num_batches().min(limit);
        (0..batches).map(move |batch_index| {
            let start = batch_index * self.batch_size;
            let end = (start + self.batch_size).min(order.len());
            self.build_batch(&order[start..end], batch_index, epoch)
        })
    }

    fn build_batch(&self, rows: &[usize], batch_index: usize, epoch: usize) -> Result<DataBatch> {
        let input_dim = self.dataset.input_dim;
        let output_dim = self.dataset.output_dim;
        let mut features = Vec::with_capacity(rows.len() * input_dim);
        for &row in rows {
            features.extend_from_slice(self.dataset.row(row));
        }

        let features = Tensor::from_vec(features, (rows.len(), input_dim), &self.device)
            .map_err(to_runtime_error)?;
        let targets = Tensor::full(
            self.dataset.target_value,
            (rows.len(), output_dim),
            &self.device,
        )
        .map_err(to_runtime_error)?;

        Ok(DataBatch {
            features,
            targets,
            rows: rows.len(),
            batch_index,
            epoch,
        })
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
