mod in_memory;

pub use in_memory::InMemoryDataset;

use ndarray::{Array1, Array2};

use crate::{MlErr, Result};

/// A batch of examples with their class labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Array1<usize>,
}

impl Batch {
    /// Creates a new `Batch`, checking there's one label per input row.
    pub fn new(inputs: Array2<f32>, labels: Array1<usize>) -> Result<Self> {
        if inputs.nrows() != labels.len() {
            return Err(MlErr::SizeMismatch {
                a: "inputs",
                b: "labels",
                got: labels.len(),
                expected: inputs.nrows(),
            });
        }

        Ok(Self { inputs, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// A lazy sequence of batches.
pub trait BatchStream: Send {
    /// Produces the next batch, or `None` once the current pass is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>>;

    /// Starts a new pass over the data.
    fn restart(&mut self);
}

/// Produces batch streams for training and evaluation.
pub trait DataSource: Send + Sync {
    /// Opens a new independent stream of batches.
    ///
    /// # Arguments
    /// * `batch_size` - The amount of examples per batch.
    /// * `is_training` - Training streams are shuffled, evaluation streams are not.
    /// * `num_threads` - A hint for how many threads may be used to produce batches.
    fn load_batch(
        &self,
        batch_size: usize,
        is_training: bool,
        num_threads: usize,
    ) -> Result<Box<dyn BatchStream>>;
}
