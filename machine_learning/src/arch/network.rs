use ndarray::{Array2, ArrayView2};
use parameters::{GradientSet, ParameterDecl, ParameterSet};

use crate::Result;

/// The output of a forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    /// One row of unnormalized class scores per example.
    pub logits: Array2<f32>,
    /// Extra loss terms registered by the network, such as weight decay.
    pub aux_losses: Vec<f32>,
}

/// A model whose parameters live outside of it.
///
/// Every call receives the parameter snapshot to compute with, so the same network can be
/// evaluated by several towers at once without any of them owning or re-declaring weights.
pub trait Network: Send + Sync {
    /// Declares every trainable parameter together with its initial value.
    fn parameters(&self) -> Vec<ParameterDecl>;

    fn num_classes(&self) -> usize;

    /// Computes the logits of a batch.
    ///
    /// # Arguments
    /// * `params` - The parameter snapshot of the current step.
    /// * `inputs` - One row per example.
    /// * `num_classes` - The width of the logits.
    /// * `is_training` - Whether training-only terms should be computed.
    fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        num_classes: usize,
        is_training: bool,
    ) -> Result<Forward>;

    /// Computes the gradient of the total loss with respect to every parameter.
    ///
    /// # Arguments
    /// * `params` - The same snapshot given to `forward`.
    /// * `inputs` - The same inputs given to `forward`.
    /// * `forward` - The result of the forward pass.
    /// * `grad_logits` - The derivative of the loss with respect to the logits.
    ///
    /// # Returns
    /// One gradient per declared parameter, aux losses included.
    fn backward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        forward: &Forward,
        grad_logits: ArrayView2<f32>,
    ) -> Result<GradientSet>;
}
