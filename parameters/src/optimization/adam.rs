use super::{
    Optimizer,
    optimizer::{check_sizes, load_slot},
};
use crate::{Result, StoreErr};

pub const DEFAULT_BETA1: f32 = 0.9;
pub const DEFAULT_BETA2: f32 = 0.999;
pub const DEFAULT_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone)]
pub struct Adam {
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    v: Box<[f32]>,
    s: Box<[f32]>,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(len: usize, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            v: vec![0.; len].into_boxed_slice(),
            s: vec![0.; len].into_boxed_slice(),
            epsilon,
        }
    }

    /// Creates a new `Adam` optimizer with the usual hyperparameters.
    pub fn with_defaults(len: usize) -> Self {
        Self::new(len, DEFAULT_BETA1, DEFAULT_BETA2, DEFAULT_EPSILON)
    }
}

impl Optimizer for Adam {
    fn update_params(&mut self, lr: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params)?;

        let Self {
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.v.iter_mut())
            .zip(self.s.iter_mut())
            .for_each(|(((p, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }

    fn state(&self) -> Vec<(&'static str, Vec<f32>)> {
        vec![
            ("v", self.v.to_vec()),
            ("s", self.s.to_vec()),
            ("beta_powers", vec![self.beta1_t, self.beta2_t]),
        ]
    }

    fn load_state(&mut self, slot: &str, values: &[f32]) -> Result<()> {
        match slot {
            "v" => load_slot(&mut self.v, values),
            "s" => load_slot(&mut self.s, values),
            "beta_powers" => {
                let mut powers = [0.; 2];
                load_slot(&mut powers, values)?;
                [self.beta1_t, self.beta2_t] = powers;
                Ok(())
            }
            _ => Err(StoreErr::UnknownSlot(slot.to_string())),
        }
    }
}
