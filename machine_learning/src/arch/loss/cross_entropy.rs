use ndarray::{Array2, ArrayView2, Axis};

use super::LossFn;

/// Softmax followed by cross entropy, averaged over the batch.
///
/// `y_pred` holds unnormalized logits. A non-finite logit makes the loss non-finite.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftmaxCrossEntropy;

impl SoftmaxCrossEntropy {
    /// Returns a new `SoftmaxCrossEntropy`.
    pub fn new() -> Self {
        Self
    }

    /// Row-wise softmax, shifted by each row's maximum for stability.
    pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
        let mut probs = logits.to_owned();

        for mut row in probs.rows_mut() {
            let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
            row.mapv_inplace(|x| (x - max).exp());
            let sum = row.sum();
            row /= sum;
        }

        probs
    }
}

impl LossFn for SoftmaxCrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let rows = y_pred.nrows();
        if rows == 0 {
            return 0.;
        }

        let total: f32 = y_pred
            .axis_iter(Axis(0))
            .zip(y.axis_iter(Axis(0)))
            .map(|(logits, target)| {
                let max = logits.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                let log_sum = logits.mapv(|x| (x - max).exp()).sum().ln() + max;

                logits
                    .iter()
                    .zip(target)
                    .map(|(&z, &t)| t * (log_sum - z))
                    .sum::<f32>()
            })
            .sum();

        total / rows as f32
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let rows = y_pred.nrows().max(1) as f32;
        (Self::softmax(y_pred) - &y) / rows
    }
}
