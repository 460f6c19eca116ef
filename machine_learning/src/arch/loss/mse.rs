use ndarray::{Array2, ArrayView2, Zip};

use super::LossFn;

/// Squared distance between the raw outputs and the one-hot targets, averaged over the
/// batch.
///
/// Each example contributes the sum over its classes, so the loss of a batch is the mean
/// of the per-example losses and the mean over equal shards equals the loss of the whole
/// batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mse;

impl Mse {
    /// Returns a new `Mse`.
    pub fn new() -> Self {
        Self
    }
}

impl LossFn for Mse {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let rows = y_pred.nrows();
        if rows == 0 {
            return 0.;
        }

        let total = Zip::from(&y_pred)
            .and(&y)
            .fold(0., |acc, &p, &t| acc + (p - t).powi(2));

        total / rows as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let rows = y_pred.nrows().max(1) as f32;
        (&y_pred - &y) * (2. / rows)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_mse() {
        let y_pred = array![[1., 2.], [3., 4.]];
        let y = array![[1., 0.], [3., 2.]];

        assert_eq!(Mse.loss(y_pred.view(), y.view()), 4.);
        assert_eq!(Mse.loss_prime(y_pred.view(), y.view()), array![[0., 2.], [0., 2.]]);
    }

    #[test]
    fn test_empty_batch() {
        let empty = Array2::<f32>::zeros((0, 3));
        assert_eq!(Mse.loss(empty.view(), empty.view()), 0.);
    }

    #[test]
    fn test_shard_losses_average_to_the_batch_loss() {
        let y_pred = array![[0.5, -1.], [2., 0.], [0., 0.], [1., 1.]];
        let y = array![[1., 0.], [0., 1.], [1., 0.], [0., 1.]];

        let full = Mse.loss(y_pred.view(), y.view());
        let halves = (Mse.loss(y_pred.slice(ndarray::s![..2, ..]), y.slice(ndarray::s![..2, ..]))
            + Mse.loss(y_pred.slice(ndarray::s![2.., ..]), y.slice(ndarray::s![2.., ..])))
            / 2.;

        assert!((full - halves).abs() < 1e-6);
    }

    #[test]
    fn test_nan_propagates() {
        let y_pred = array![[f32::NAN, 0.]];
        let y = array![[1., 0.]];

        assert!(Mse.loss(y_pred.view(), y.view()).is_nan());
    }
}
