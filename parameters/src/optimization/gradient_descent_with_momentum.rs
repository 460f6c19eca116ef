use super::{
    Optimizer,
    optimizer::{check_sizes, load_slot},
};
use crate::{Result, StoreErr};

#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(len: usize, momentum: f32) -> Self {
        Self {
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, lr: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params)?;
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });

        Ok(())
    }

    fn state(&self) -> Vec<(&'static str, Vec<f32>)> {
        vec![("velocity", self.velocity.to_vec())]
    }

    fn load_state(&mut self, slot: &str, values: &[f32]) -> Result<()> {
        match slot {
            "velocity" => load_slot(&mut self.velocity, values),
            _ => Err(StoreErr::UnknownSlot(slot.to_string())),
        }
    }
}
