use parameters::GradientSet;
use rayon::prelude::*;

use crate::ReduceErr;

/// Averages the gradients of every tower into a single update.
#[derive(Debug, Default, Clone, Copy)]
pub struct GradientReducer;

impl GradientReducer {
    pub fn new() -> Self {
        Self
    }

    /// Computes the arithmetic mean of the tower gradients, parameter by parameter.
    ///
    /// Gradients are summed in tower order and every parameter is reduced in parallel.
    ///
    /// # Arguments
    /// * `towers` - One gradient set per tower.
    ///
    /// # Returns
    /// The averaged gradient, or an error if the towers disagree on which parameters they
    /// produced gradients for or on their shapes.
    pub fn reduce(&self, towers: &[GradientSet]) -> Result<GradientSet, ReduceErr> {
        let (first, rest) = towers.split_first().ok_or(ReduceErr::Empty)?;
        if first.is_empty() {
            return Err(ReduceErr::Empty);
        }

        for (i, grads) in rest.iter().enumerate() {
            let tower = i + 1;
            if !grads.names().eq(first.names()) {
                return Err(ReduceErr::ParameterUniverse { tower });
            }

            for ((name, expected), (_, got)) in first.iter().zip(grads) {
                if got.shape() != expected.shape() {
                    return Err(ReduceErr::ShapeMismatch {
                        name: name.clone(),
                        tower,
                        got: got.shape().to_vec(),
                        expected: expected.shape().to_vec(),
                    });
                }
            }
        }

        let scale = 1. / towers.len() as f32;
        let names: Vec<_> = first.names().collect();

        let reduced: Vec<_> = names
            .par_iter()
            .map(|&name| {
                let mut sum = first
                    .get(name)
                    .map(|grad| grad.to_owned())
                    .unwrap_or_default();

                for grads in rest {
                    if let Some(grad) = grads.get(name) {
                        sum += grad;
                    }
                }

                sum *= scale;
                (name.to_string(), sum)
            })
            .collect();

        Ok(reduced.into_iter().collect())
    }
}
