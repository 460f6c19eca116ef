use std::sync::Arc;

use futures::future;
use log::{debug, error};
use machine_learning::Batch;
use parameters::ParameterSet;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tokio::sync::oneshot;

use crate::{Result, TowerErr, TowerOutput, TowerRunner};

/// A fixed set of device threads, one per tower.
///
/// A step dispatches one tower per device and only completes once every device replied,
/// which makes it the barrier between computing the gradients of a step and applying them.
#[derive(Debug)]
pub struct DevicePool {
    pool: ThreadPool,
    num_devices: usize,
}

impl DevicePool {
    /// Creates a new `DevicePool`.
    ///
    /// # Arguments
    /// * `num_devices` - The amount of device threads to start.
    pub fn new(num_devices: usize) -> Result<Self> {
        if num_devices == 0 {
            return Err(TowerErr::NoDevices);
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(num_devices)
            .thread_name(|i| format!("device-{i}"))
            .panic_handler(|_| error!("a tower panicked on its device thread"))
            .build()
            .map_err(|e| TowerErr::Runtime(e.to_string()))?;

        debug!(num_devices = num_devices; "started device pool");
        Ok(Self { pool, num_devices })
    }

    pub fn num_devices(&self) -> usize {
        self.num_devices
    }

    /// Runs every tower on its own device and waits for all of them.
    ///
    /// # Arguments
    /// * `towers` - One runner per device.
    /// * `params` - The snapshot every tower reads.
    /// * `shards` - One shard per device, in device order.
    ///
    /// # Returns
    /// The outputs in device order, or the error of the lowest failing device.
    pub async fn run_towers(
        &self,
        towers: &[Arc<TowerRunner>],
        params: Arc<ParameterSet>,
        shards: Vec<Batch>,
    ) -> Result<Vec<TowerOutput>> {
        if towers.len() != self.num_devices || shards.len() != self.num_devices {
            return Err(TowerErr::DeviceCount {
                got: towers.len().min(shards.len()),
                expected: self.num_devices,
            });
        }

        let replies: Vec<_> = towers
            .iter()
            .zip(shards)
            .map(|(tower, shard)| {
                let (tx, rx) = oneshot::channel();
                let device = tower.device();
                let tower = Arc::clone(tower);
                let params = Arc::clone(&params);

                self.pool.spawn(move || {
                    let _ = tx.send(tower.run(&params, &shard));
                });

                (device, rx)
            })
            .collect();

        future::join_all(replies.into_iter().map(|(device, rx)| async move {
            rx.await.unwrap_or(Err(TowerErr::DeviceLost(device)))
        }))
        .await
        .into_iter()
        .collect()
    }
}
