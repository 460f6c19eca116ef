use log::debug;
use ndarray::ArrayD;

use crate::{
    Result, StoreErr,
    optimization::Optimizer,
    storage::{ParameterSet, ParameterStore},
};

/// The decay used when none is configured.
pub const DEFAULT_DECAY: f32 = 0.9999;

/// Keeps an exponential moving average ("shadow") of every trainable parameter.
///
/// Early in training the effective decay is `min(decay, (1 + step) / (10 + step))`, so the
/// shadows follow the live parameters closely until enough steps have been taken.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    decay: f32,
    shadows: ParameterSet,
}

impl MovingAverage {
    /// Creates a new `MovingAverage` whose shadows start at the current parameter values.
    ///
    /// # Arguments
    /// * `decay` - The upper bound of the decay, in `[0, 1)`.
    /// * `store` - The store holding the parameters to track.
    pub fn new<O: Optimizer>(decay: f32, store: &ParameterStore<O>) -> Result<Self> {
        Ok(Self {
            decay,
            shadows: store.pull_params()?,
        })
    }

    pub fn decay(&self) -> f32 {
        self.decay
    }

    /// Returns the effective decay for the given global step.
    pub fn decay_at(&self, step: u64) -> f32 {
        let step = step as f64;
        let warmup = (1. + step) / (10. + step);
        self.decay.min(warmup as f32)
    }

    /// Moves every shadow towards the current value of its parameter.
    ///
    /// # Arguments
    /// * `store` - The store holding the live parameters.
    /// * `step` - The global step the parameters belong to.
    ///
    /// # Returns
    /// The effective decay that was used.
    pub fn update<O: Optimizer>(&mut self, store: &ParameterStore<O>, step: u64) -> Result<f32> {
        let decay = self.decay_at(step);
        let shadows = &mut self.shadows;

        store.try_visit(|name, shape, weights| {
            let shadow = shadows
                .get_mut(name)
                .ok_or_else(|| StoreErr::MissingTensor(name.to_string()))?;

            if shadow.shape() != shape {
                return Err(StoreErr::ShapeMismatch {
                    name: name.to_string(),
                    got: shadow.shape().to_vec(),
                    expected: shape.to_vec(),
                });
            }

            shadow
                .iter_mut()
                .zip(weights)
                .for_each(|(s, w)| *s -= (1. - decay) * (*s - w));

            Ok(())
        })?;

        debug!(global_step = step, decay = decay; "updated moving averages");
        Ok(decay)
    }

    pub fn shadows(&self) -> &ParameterSet {
        &self.shadows
    }

    pub fn shadow(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.shadows.get(name)
    }

    /// Replaces the shadows, as when restoring a checkpoint.
    ///
    /// Every shadow must already exist with the same shape.
    pub fn restore(&mut self, shadows: ParameterSet) -> Result<()> {
        for (name, current) in &self.shadows {
            let restored = shadows
                .get(name)
                .ok_or_else(|| StoreErr::MissingTensor(name.clone()))?;

            if restored.shape() != current.shape() {
                return Err(StoreErr::ShapeMismatch {
                    name: name.clone(),
                    got: restored.shape().to_vec(),
                    expected: current.shape().to_vec(),
                });
            }
        }

        if let Some(name) = shadows.names().find(|name| !self.shadows.contains(name)) {
            return Err(StoreErr::UnknownParameter(name.to_string()));
        }

        self.shadows = shadows;
        Ok(())
    }
}
