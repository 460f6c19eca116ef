use tokio_util::sync::CancellationToken;
use towers::DevicePool;

use crate::TrainError;

/// Everything a training run executes on, owned by the caller.
///
/// The context holds the device pool the towers run on and the token used to ask a
/// running loop to stop at its next step boundary.
pub struct ExecutionContext {
    pool: DevicePool,
    stop: CancellationToken,
}

impl ExecutionContext {
    /// Creates a new `ExecutionContext` with one device worker per device.
    ///
    /// # Errors
    /// A `TrainError::Config` if `num_devices` is zero.
    pub fn new(num_devices: usize) -> Result<Self, TrainError> {
        let pool = DevicePool::new(num_devices)?;

        Ok(Self {
            pool,
            stop: CancellationToken::new(),
        })
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn num_devices(&self) -> usize {
        self.pool.num_devices()
    }

    /// Asks every loop running on this context to stop after its current step.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn should_stop(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// A handle to the stop signal, cancelling it is the same as `request_stop`.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}
