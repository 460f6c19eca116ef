use log::debug;
use machine_learning::{Batch, BatchStream, DataSource, MlErr};
use ndarray::s;

use crate::{Result, TowerErr};

/// Divides the global batch evenly across the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSplitter {
    batch_size: usize,
    num_devices: usize,
}

impl DeviceSplitter {
    /// Creates a new `DeviceSplitter`.
    ///
    /// # Arguments
    /// * `batch_size` - The global batch size of a step.
    /// * `num_devices` - The amount of towers running each step.
    ///
    /// # Returns
    /// The splitter, or an error when `batch_size` isn't a positive multiple of `num_devices`.
    pub fn new(batch_size: usize, num_devices: usize) -> Result<Self> {
        if num_devices == 0 {
            return Err(TowerErr::NoDevices);
        }

        if batch_size == 0 || batch_size % num_devices != 0 {
            return Err(TowerErr::IndivisibleBatch {
                batch_size,
                num_devices,
            });
        }

        Ok(Self {
            batch_size,
            num_devices,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// The amount of examples each device receives per step.
    pub fn shard_size(&self) -> usize {
        self.batch_size / self.num_devices
    }

    /// Opens one independent stream per device, each yielding shard-sized batches.
    pub fn open_streams(
        &self,
        source: &dyn DataSource,
        is_training: bool,
        num_threads: usize,
    ) -> std::result::Result<Vec<Box<dyn BatchStream>>, MlErr> {
        debug!(
            num_devices = self.num_devices, shard_size = self.shard_size();
            "opening device streams"
        );

        (0..self.num_devices)
            .map(|_| source.load_batch(self.shard_size(), is_training, num_threads))
            .collect()
    }

    /// Splits a full batch into one contiguous shard per device.
    pub fn split(&self, batch: &Batch) -> Result<Vec<Batch>> {
        if batch.len() != self.batch_size {
            return Err(TowerErr::IndivisibleBatch {
                batch_size: batch.len(),
                num_devices: self.num_devices,
            });
        }

        let shard_size = self.shard_size();

        (0..self.num_devices)
            .map(|device| {
                let rows = device * shard_size..(device + 1) * shard_size;
                let inputs = batch.inputs.slice(s![rows.clone(), ..]).to_owned();
                let labels = batch.labels.slice(s![rows]).to_owned();

                Batch::new(inputs, labels).map_err(|source| TowerErr::Model { device, source })
            })
            .collect()
    }
}
