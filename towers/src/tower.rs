use std::sync::Arc;

use log::trace;
use machine_learning::{
    Batch, LossFn, Network,
    utils::{argmax, one_hot},
};
use parameters::{GradientSet, ParameterSet};

use crate::{Result, TowerErr};

/// Everything a tower produced for one step.
#[derive(Debug, Clone)]
pub struct TowerOutput {
    pub device: usize,
    /// The model loss plus every aux loss.
    pub loss: f32,
    pub model_loss: f32,
    pub aux_loss: f32,
    pub gradients: GradientSet,
    pub correct: usize,
    pub examples: usize,
}

impl TowerOutput {
    /// Returns `true` if neither the loss nor any gradient holds a NaN or an infinity.
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite() && self.gradients.is_finite()
    }

    pub fn accuracy(&self) -> f32 {
        if self.examples == 0 {
            return 0.;
        }

        self.correct as f32 / self.examples as f32
    }
}

/// Computes the loss and the gradients of one device's shard.
///
/// Only the first tower declares the parameters; the rest reuse them. Every tower reads
/// the same immutable snapshot, so all of them see the parameters of the same step.
pub struct TowerRunner {
    device: usize,
    reuse: bool,
    scope: String,
    network: Arc<dyn Network>,
    loss_fn: Arc<dyn LossFn>,
}

impl TowerRunner {
    /// Creates a new `TowerRunner`.
    ///
    /// # Arguments
    /// * `device` - The index of the device this tower runs on.
    /// * `network` - The shared model.
    /// * `loss_fn` - The shared loss function.
    pub fn new(device: usize, network: Arc<dyn Network>, loss_fn: Arc<dyn LossFn>) -> Self {
        Self {
            device,
            reuse: device > 0,
            scope: format!("tower_{device}"),
            network,
            loss_fn,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn reuse(&self) -> bool {
        self.reuse
    }

    /// The name this tower's values are reported under.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Runs the forward and backward passes over a shard.
    ///
    /// Non-finite losses aren't treated as errors here, they're returned for the caller to
    /// decide on.
    ///
    /// # Arguments
    /// * `params` - The parameter snapshot of the current step.
    /// * `shard` - This device's share of the batch.
    pub fn run(&self, params: &ParameterSet, shard: &Batch) -> Result<TowerOutput> {
        let device = self.device;
        let model_err = |source| TowerErr::Model { device, source };

        let network = self.network.as_ref();
        let num_classes = network.num_classes();
        let inputs = shard.inputs.view();

        let forward = network
            .forward(params, inputs, num_classes, true)
            .map_err(model_err)?;
        let targets = one_hot(shard.labels.view(), num_classes).map_err(model_err)?;

        let model_loss = self.loss_fn.loss(forward.logits.view(), targets.view());
        let aux_loss: f32 = forward.aux_losses.iter().sum();

        let predictions = argmax(forward.logits.view());
        let correct = predictions
            .iter()
            .zip(&shard.labels)
            .filter(|(prediction, label)| prediction == label)
            .count();

        let grad_logits = self
            .loss_fn
            .loss_prime(forward.logits.view(), targets.view());
        let gradients = network
            .backward(params, inputs, &forward, grad_logits.view())
            .map_err(model_err)?;

        self.check_gradients(params, &gradients)?;

        trace!(
            scope = self.scope.as_str(), reuse = self.reuse, loss = model_loss;
            "tower finished"
        );

        Ok(TowerOutput {
            device,
            loss: model_loss + aux_loss,
            model_loss,
            aux_loss,
            gradients,
            correct,
            examples: shard.len(),
        })
    }

    /// Checks there's exactly one gradient per parameter, shaped like it.
    fn check_gradients(&self, params: &ParameterSet, gradients: &GradientSet) -> Result<()> {
        let mismatch = |name: &str| TowerErr::GradientMismatch {
            device: self.device,
            name: name.to_string(),
        };

        if let Some(name) = gradients.names().find(|name| !params.contains(name)) {
            return Err(mismatch(name));
        }

        for (name, param) in params {
            match gradients.get(name) {
                Some(grad) if grad.shape() == param.shape() => {}
                _ => return Err(mismatch(name)),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use machine_learning::{
        Forward, MlErr, SoftmaxClassifier, SoftmaxCrossEntropy, Result as MlResult,
    };
    use ndarray::{ArrayD, ArrayView2, IxDyn, array};
    use parameters::ParameterDecl;

    use super::*;

    fn snapshot(network: &dyn Network) -> ParameterSet {
        network
            .parameters()
            .into_iter()
            .map(|decl| (decl.name, decl.value))
            .collect()
    }

    fn shard() -> Batch {
        Batch::new(array![[1., 0.], [0., 1.], [1., 1.], [-1., 0.]], array![0, 1, 1, 0]).unwrap()
    }

    /// Scales its single weight into the first logit, ignoring the inputs.
    struct ScaledNetwork {
        gradient: ArrayD<f32>,
    }

    impl Network for ScaledNetwork {
        fn parameters(&self) -> Vec<ParameterDecl> {
            vec![ParameterDecl::new("w", ArrayD::ones(IxDyn(&[1])))]
        }

        fn num_classes(&self) -> usize {
            2
        }

        fn forward(
            &self,
            params: &ParameterSet,
            inputs: ArrayView2<f32>,
            _: usize,
            _: bool,
        ) -> MlResult<Forward> {
            let w = params.get("w").ok_or(MlErr::MissingParameter("w".into()))?[0];
            let mut logits = ndarray::Array2::zeros((inputs.nrows(), 2));
            logits.column_mut(0).fill(w);
            Ok(Forward {
                logits,
                aux_losses: vec![0.5],
            })
        }

        fn backward(
            &self,
            _: &ParameterSet,
            _: ArrayView2<f32>,
            _: &Forward,
            _: ArrayView2<f32>,
        ) -> MlResult<GradientSet> {
            let mut grads = GradientSet::new();
            grads.insert("w", self.gradient.clone());
            Ok(grads)
        }
    }

    #[test]
    fn test_reuse_flag() {
        let network: Arc<dyn Network> = Arc::new(SoftmaxClassifier::new(2, 2, 0));
        let first = TowerRunner::new(0, network.clone(), Arc::new(SoftmaxCrossEntropy));
        let second = TowerRunner::new(1, network, Arc::new(SoftmaxCrossEntropy));

        assert!(!first.reuse());
        assert!(second.reuse());
        assert_eq!(second.scope(), "tower_1");
    }

    #[test]
    fn test_run_produces_loss_gradients_and_accuracy() {
        let network = Arc::new(SoftmaxClassifier::new(2, 2, 3));
        let params = snapshot(network.as_ref());
        let tower = TowerRunner::new(0, network, Arc::new(SoftmaxCrossEntropy));

        let output = tower.run(&params, &shard()).unwrap();

        assert!(output.is_finite());
        assert!(output.loss > 0.);
        assert_eq!(output.examples, 4);
        assert!(output.correct <= 4);
        assert_eq!(
            output.gradients.names().collect::<Vec<_>>(),
            ["softmax/biases", "softmax/weights"]
        );
    }

    #[test]
    fn test_aux_losses_are_added() {
        let network = Arc::new(ScaledNetwork {
            gradient: ArrayD::ones(IxDyn(&[1])),
        });
        let params = snapshot(network.as_ref());
        let tower = TowerRunner::new(0, network, Arc::new(SoftmaxCrossEntropy));

        let output = tower.run(&params, &shard()).unwrap();

        assert_eq!(output.aux_loss, 0.5);
        assert_eq!(output.loss, output.model_loss + 0.5);
        assert_eq!(output.correct, 2);
        assert_eq!(output.accuracy(), 0.5);
    }

    #[test]
    fn test_non_finite_loss_is_returned() {
        let network = Arc::new(ScaledNetwork {
            gradient: ArrayD::ones(IxDyn(&[1])),
        });
        let mut params = snapshot(network.as_ref());
        params.insert("w", ArrayD::from_elem(IxDyn(&[1]), f32::NAN));
        let tower = TowerRunner::new(0, network, Arc::new(SoftmaxCrossEntropy));

        let output = tower.run(&params, &shard()).unwrap();
        assert!(!output.loss.is_finite());
        assert!(!output.is_finite());
    }

    #[test]
    fn test_rejects_mismatched_gradients() {
        let network = Arc::new(ScaledNetwork {
            gradient: ArrayD::ones(IxDyn(&[2])),
        });
        let params = snapshot(network.as_ref());
        let tower = TowerRunner::new(1, network, Arc::new(SoftmaxCrossEntropy));

        let err = tower.run(&params, &shard()).unwrap_err();
        assert_eq!(
            err,
            TowerErr::GradientMismatch {
                device: 1,
                name: "w".into()
            }
        );
    }
}
