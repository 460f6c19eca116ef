use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewD, Axis, Ix1, Ix2};
use parameters::{GradientSet, ParameterDecl, ParameterSet};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use super::{Forward, Network};
use crate::{MlErr, Result};

const WEIGHTS: &str = "softmax/weights";
const BIASES: &str = "softmax/biases";

/// A single dense layer producing class logits, meant to be trained with
/// `SoftmaxCrossEntropy`.
#[derive(Debug, Clone)]
pub struct SoftmaxClassifier {
    num_features: usize,
    num_classes: usize,
    weight_decay: f32,
    seed: u64,
}

impl SoftmaxClassifier {
    /// Creates a new `SoftmaxClassifier`.
    ///
    /// # Arguments
    /// * `num_features` - The width of every input row.
    /// * `num_classes` - The amount of classes to predict.
    /// * `seed` - The seed for the weight initialization.
    pub fn new(num_features: usize, num_classes: usize, seed: u64) -> Self {
        Self {
            num_features,
            num_classes,
            weight_decay: 0.,
            seed,
        }
    }

    /// Adds an L2 penalty of `0.5 * weight_decay * |W|^2` as an aux loss while training.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    fn weights<'a>(&self, params: &'a ParameterSet) -> Result<ArrayView2<'a, f32>> {
        let weights = view(params, WEIGHTS)?
            .into_dimensionality::<Ix2>()
            .map_err(|_| invalid(params, WEIGHTS))?;

        if weights.dim() != (self.num_features, self.num_classes) {
            return Err(invalid(params, WEIGHTS));
        }

        Ok(weights)
    }

    fn biases<'a>(&self, params: &'a ParameterSet) -> Result<ArrayView1<'a, f32>> {
        let biases = view(params, BIASES)?
            .into_dimensionality::<Ix1>()
            .map_err(|_| invalid(params, BIASES))?;

        if biases.len() != self.num_classes {
            return Err(invalid(params, BIASES));
        }

        Ok(biases)
    }

    fn check_inputs(&self, inputs: &ArrayView2<f32>) -> Result<()> {
        if inputs.ncols() != self.num_features {
            return Err(MlErr::SizeMismatch {
                a: "inputs",
                b: "weights",
                got: inputs.ncols(),
                expected: self.num_features,
            });
        }

        Ok(())
    }
}

fn view<'a>(params: &'a ParameterSet, name: &str) -> Result<ArrayViewD<'a, f32>> {
    params
        .get(name)
        .map(|tensor| tensor.view())
        .ok_or_else(|| MlErr::MissingParameter(name.to_string()))
}

fn invalid(params: &ParameterSet, name: &str) -> MlErr {
    MlErr::InvalidParameter {
        name: name.to_string(),
        shape: params
            .get(name)
            .map(|tensor| tensor.shape().to_vec())
            .unwrap_or_default(),
    }
}

impl Network for SoftmaxClassifier {
    fn parameters(&self) -> Vec<ParameterDecl> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let stddev = 1. / (self.num_features.max(1) as f32).sqrt();

        let weights = Array2::from_shape_simple_fn((self.num_features, self.num_classes), || {
            rng.sample::<f32, _>(StandardNormal) * stddev
        });
        let biases = Array1::<f32>::zeros(self.num_classes);

        vec![
            ParameterDecl::new(WEIGHTS, weights.into_dyn()),
            ParameterDecl::new(BIASES, biases.into_dyn()),
        ]
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        num_classes: usize,
        is_training: bool,
    ) -> Result<Forward> {
        if num_classes != self.num_classes {
            return Err(MlErr::SizeMismatch {
                a: "requested classes",
                b: "network classes",
                got: num_classes,
                expected: self.num_classes,
            });
        }

        self.check_inputs(&inputs)?;
        let weights = self.weights(params)?;
        let biases = self.biases(params)?;

        let logits = inputs.dot(&weights) + &biases;

        let mut aux_losses = Vec::new();
        if is_training && self.weight_decay > 0. {
            let squared: f32 = weights.iter().map(|w| w * w).sum();
            aux_losses.push(0.5 * self.weight_decay * squared);
        }

        Ok(Forward { logits, aux_losses })
    }

    fn backward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        forward: &Forward,
        grad_logits: ArrayView2<f32>,
    ) -> Result<GradientSet> {
        self.check_inputs(&inputs)?;
        if grad_logits.dim() != forward.logits.dim() {
            return Err(MlErr::SizeMismatch {
                a: "logit gradient",
                b: "logits",
                got: grad_logits.len(),
                expected: forward.logits.len(),
            });
        }

        let weights = self.weights(params)?;

        let mut dw = inputs.t().dot(&grad_logits);
        if !forward.aux_losses.is_empty() {
            dw.scaled_add(self.weight_decay, &weights);
        }
        let db = grad_logits.sum_axis(Axis(0));

        let mut grads = GradientSet::new();
        grads.insert(WEIGHTS, dw.into_dyn());
        grads.insert(BIASES, db.into_dyn());
        Ok(grads)
    }
}
