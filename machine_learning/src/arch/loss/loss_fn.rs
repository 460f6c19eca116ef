use ndarray::{Array2, ArrayView2};

/// A differentiable scalar loss over a batch of predictions.
///
/// Both methods take the raw network output as `y_pred` and the one-hot encoded labels
/// as `y`, one row per example.
pub trait LossFn: Send + Sync {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32>;
}
