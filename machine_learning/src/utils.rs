use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use crate::{MlErr, Result};

/// Encodes class indices as one-hot rows.
///
/// # Arguments
/// * `labels` - One class index per example.
/// * `num_classes` - The width of every row.
///
/// # Returns
/// A `labels.len() x num_classes` matrix, or an error if a label is out of range.
pub fn one_hot(labels: ArrayView1<usize>, num_classes: usize) -> Result<Array2<f32>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));

    for (mut row, &label) in encoded.rows_mut().into_iter().zip(labels) {
        if label >= num_classes {
            return Err(MlErr::LabelOutOfRange { label, num_classes });
        }

        row[label] = 1.;
    }

    Ok(encoded)
}

/// Returns the index of the largest value of every row, the first one on ties.
pub fn argmax(logits: ArrayView2<f32>) -> Array1<usize> {
    logits.map_axis(Axis(1), |row| {
        row.iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(best, max), (i, &x)| {
                if x > max { (i, x) } else { (best, max) }
            })
            .0
    })
}
