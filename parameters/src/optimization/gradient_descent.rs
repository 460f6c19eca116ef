use super::{Optimizer, optimizer::check_sizes};
use crate::Result;

/// Plain stochastic gradient descent, it holds no state.
#[derive(Debug, Default, Clone, Copy)]
pub struct GradientDescent;

impl GradientDescent {
    pub fn new() -> Self {
        Self
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, lr: f32, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_sizes(grad, params)?;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }

        Ok(())
    }
}
