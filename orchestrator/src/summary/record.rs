use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The distribution of the values of a tensor.
///
/// Non-finite values are left out of every statistic and bucket, `count` only counts the
/// finite ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
    pub count: usize,
    /// The upper bound of every bucket, the last one is `max`.
    pub bucket_limits: Vec<f32>,
    pub bucket_counts: Vec<usize>,
}

impl Histogram {
    /// Computes the histogram of `values` with up to `buckets` equal-width buckets.
    pub fn from_values(values: &[f32], buckets: usize) -> Self {
        let finite: Vec<f32> = values.iter().copied().filter(|x| x.is_finite()).collect();
        let count = finite.len();

        if count == 0 {
            return Self {
                min: 0.,
                max: 0.,
                mean: 0.,
                std: 0.,
                count,
                bucket_limits: Vec::new(),
                bucket_counts: Vec::new(),
            };
        }

        let (min, max) = finite
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));

        let n = count as f64;
        let mean = finite.iter().map(|&x| x as f64).sum::<f64>() / n;
        let variance = finite.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / n;

        let buckets = if min == max { 1 } else { buckets.max(1) };
        let width = (max - min) / buckets as f32;

        let mut bucket_counts = vec![0; buckets];
        for &x in &finite {
            let i = if width > 0. {
                (((x - min) / width) as usize).min(buckets - 1)
            } else {
                0
            };
            bucket_counts[i] += 1;
        }

        let bucket_limits = (1..=buckets)
            .map(|i| if i == buckets { max } else { min + width * i as f32 })
            .collect();

        Self {
            min,
            max,
            mean: mean as f32,
            std: variance.sqrt() as f32,
            count,
            bucket_limits,
            bucket_counts,
        }
    }
}

/// One line of the summary log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub step: u64,
    /// Seconds since the unix epoch.
    pub wall_time: f64,
    pub scalars: BTreeMap<String, f32>,
    pub histograms: BTreeMap<String, Histogram>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_statistics() {
        let hist = Histogram::from_values(&[0., 1., 2., 3., f32::NAN], 3);

        assert_eq!(hist.count, 4);
        assert_eq!((hist.min, hist.max), (0., 3.));
        assert_eq!(hist.mean, 1.5);
        assert!((hist.std - 1.25f32.sqrt()).abs() < 1e-6);
        assert_eq!(hist.bucket_limits, [1., 2., 3.]);
        assert_eq!(hist.bucket_counts, [1, 1, 2]);
    }

    #[test]
    fn test_constant_and_empty_tensors() {
        let hist = Histogram::from_values(&[2.; 5], 10);
        assert_eq!(hist.bucket_counts, [5]);
        assert_eq!(hist.std, 0.);

        let empty = Histogram::from_values(&[], 10);
        assert_eq!(empty.count, 0);
        assert!(empty.bucket_counts.is_empty());
    }
}
