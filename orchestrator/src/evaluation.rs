use std::{path::Path, sync::Arc};

use log::debug;
use machine_learning::{
    DataSource, EvalMetrics, Evaluator, LossFn, MlErr, Network,
    Result as MlResult,
    utils::{argmax, one_hot},
};

use crate::CheckpointManager;

/// Evaluates persisted checkpoints over the evaluation stream of a data source.
///
/// The moving averages of the parameters are evaluated by default, since they're the
/// weights meant for inference.
pub struct CheckpointEvaluator {
    network: Arc<dyn Network>,
    loss_fn: Arc<dyn LossFn>,
    data: Arc<dyn DataSource>,
    use_shadows: bool,
}

impl CheckpointEvaluator {
    pub fn new(
        network: Arc<dyn Network>,
        loss_fn: Arc<dyn LossFn>,
        data: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            network,
            loss_fn,
            data,
            use_shadows: true,
        }
    }

    /// Whether to evaluate the moving averages instead of the raw parameters.
    pub fn use_shadows(mut self, use_shadows: bool) -> Self {
        self.use_shadows = use_shadows;
        self
    }
}

impl Evaluator for CheckpointEvaluator {
    fn evaluate(
        &self,
        checkpoint_dir: &Path,
        batch_size: usize,
        checkpoint_name: Option<&str>,
    ) -> MlResult<EvalMetrics> {
        let snapshot = CheckpointManager::restore(checkpoint_dir, checkpoint_name)
            .map_err(|e| MlErr::Evaluation(e.to_string()))?
            .ok_or_else(|| {
                MlErr::Evaluation(format!("no checkpoint found in {}", checkpoint_dir.display()))
            })?;

        let params = if self.use_shadows {
            &snapshot.shadows
        } else {
            &snapshot.params
        };

        let num_classes = self.network.num_classes();
        let mut stream = self.data.load_batch(batch_size, false, 1)?;

        let mut total_loss = 0.;
        let mut correct = 0;
        let mut num_examples = 0;

        while let Some(batch) = stream.next_batch()? {
            let forward = self
                .network
                .forward(params, batch.inputs.view(), num_classes, false)?;
            let targets = one_hot(batch.labels.view(), num_classes)?;

            let loss = self.loss_fn.loss(forward.logits.view(), targets.view())
                + forward.aux_losses.iter().sum::<f32>();
            total_loss += loss as f64 * batch.len() as f64;

            correct += argmax(forward.logits.view())
                .iter()
                .zip(&batch.labels)
                .filter(|(prediction, label)| prediction == label)
                .count();
            num_examples += batch.len();
        }

        if num_examples == 0 {
            return Err(MlErr::EmptyDataset);
        }

        let metrics = EvalMetrics {
            global_step: snapshot.metadata.global_step,
            loss: (total_loss / num_examples as f64) as f32,
            accuracy: correct as f32 / num_examples as f32,
            num_examples,
        };

        debug!(
            global_step = metrics.global_step, shadows = self.use_shadows;
            "evaluated {}", snapshot.path.display()
        );
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use machine_learning::{InMemoryDataset, SoftmaxClassifier, SoftmaxCrossEntropy};
    use parameters::ParameterSet;

    use super::*;

    fn evaluator() -> (CheckpointEvaluator, ParameterSet) {
        let network = SoftmaxClassifier::new(4, 3, 7);
        let params: ParameterSet = network
            .parameters()
            .into_iter()
            .map(|decl| (decl.name, decl.value))
            .collect();

        let evaluator = CheckpointEvaluator::new(
            Arc::new(network),
            Arc::new(SoftmaxCrossEntropy),
            Arc::new(InMemoryDataset::synthetic(50, 4, 3, 7).unwrap()),
        );

        (evaluator, params)
    }

    #[test]
    fn test_evaluates_latest_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (evaluator, params) = evaluator();

        let manager = CheckpointManager::new(dir.path());
        manager
            .save(4, 5, &params, &params, &BTreeMap::new())
            .unwrap();

        let metrics = evaluator.evaluate(dir.path(), 10, None).unwrap();
        assert_eq!(metrics.global_step, 5);
        assert_eq!(metrics.num_examples, 50);
        assert!(metrics.loss.is_finite() && metrics.loss > 0.);
        assert!((0. ..=1.).contains(&metrics.accuracy));

        let named = evaluator
            .use_shadows(false)
            .evaluate(dir.path(), 10, Some(&CheckpointManager::snapshot_name(4)))
            .unwrap();
        assert_eq!(named, metrics);
    }

    #[test]
    fn test_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (evaluator, _) = evaluator();

        assert!(matches!(
            evaluator.evaluate(dir.path(), 10, None),
            Err(MlErr::Evaluation(_))
        ));
    }
}
