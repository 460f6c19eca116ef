use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use log::debug;
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::StandardNormal;

use super::{Batch, BatchStream, DataSource};
use crate::{MlErr, Result};

/// A labelled dataset held entirely in memory.
///
/// Every training stream shuffles the examples once per pass with its own seeded
/// generator, evaluation streams go through them in order. Trailing examples that don't
/// fill a whole batch are dropped.
#[derive(Debug)]
pub struct InMemoryDataset {
    inputs: Arc<Array2<f32>>,
    labels: Arc<Array1<usize>>,
    seed: u64,
    streams: AtomicU64,
}

impl InMemoryDataset {
    /// Creates a new `InMemoryDataset`.
    ///
    /// # Arguments
    /// * `inputs` - One row per example.
    /// * `labels` - One class index per example.
    /// * `seed` - The base seed for shuffling.
    pub fn new(inputs: Array2<f32>, labels: Array1<usize>, seed: u64) -> Result<Self> {
        let Batch { inputs, labels } = Batch::new(inputs, labels)?;
        if labels.is_empty() {
            return Err(MlErr::EmptyDataset);
        }

        Ok(Self {
            inputs: Arc::new(inputs),
            labels: Arc::new(labels),
            seed,
            streams: AtomicU64::new(0),
        })
    }

    /// Generates gaussian clusters, one per class, around random centers.
    ///
    /// # Arguments
    /// * `num_examples` - The amount of examples to generate.
    /// * `num_features` - The width of every input row.
    /// * `num_classes` - The amount of clusters.
    /// * `seed` - The seed for both generation and shuffling.
    pub fn synthetic(
        num_examples: usize,
        num_features: usize,
        num_classes: usize,
        seed: u64,
    ) -> Result<Self> {
        if num_classes == 0 {
            return Err(MlErr::NoClasses);
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let centers = Array2::from_shape_simple_fn((num_classes, num_features), || {
            3. * rng.sample::<f32, _>(StandardNormal)
        });
        let labels = Array1::from_shape_fn(num_examples, |i| i % num_classes);

        let mut inputs = Array2::zeros((num_examples, num_features));
        for (mut row, &label) in inputs.rows_mut().into_iter().zip(&labels) {
            row.assign(&centers.row(label));
            row.mapv_inplace(|x| x + rng.sample::<f32, _>(StandardNormal));
        }

        Self::new(inputs, labels, seed)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.inputs.ncols()
    }
}

impl DataSource for InMemoryDataset {
    fn load_batch(
        &self,
        batch_size: usize,
        is_training: bool,
        num_threads: usize,
    ) -> Result<Box<dyn BatchStream>> {
        if batch_size == 0 || batch_size > self.len() {
            return Err(MlErr::InvalidBatchSize(batch_size));
        }

        let stream_id = self.streams.fetch_add(1, Ordering::Relaxed);
        debug!(
            stream_id = stream_id, batch_size = batch_size, is_training = is_training,
            num_threads = num_threads; "opening in-memory batch stream"
        );

        let mut stream = InMemoryStream {
            inputs: Arc::clone(&self.inputs),
            labels: Arc::clone(&self.labels),
            order: (0..self.len()).collect(),
            cursor: 0,
            batch_size,
            shuffle: is_training,
            rng: StdRng::seed_from_u64(self.seed.wrapping_add(stream_id)),
        };
        stream.restart();

        Ok(Box::new(stream))
    }
}

struct InMemoryStream {
    inputs: Arc<Array2<f32>>,
    labels: Arc<Array1<usize>>,
    order: Vec<usize>,
    cursor: usize,
    batch_size: usize,
    shuffle: bool,
    rng: StdRng,
}

impl BatchStream for InMemoryStream {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let end = self.cursor + self.batch_size;
        if end > self.order.len() {
            return Ok(None);
        }

        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let inputs = self.inputs.select(Axis(0), indices);
        let labels = self.labels.select(Axis(0), indices);
        Batch::new(inputs, labels).map(Some)
    }

    fn restart(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }
}
