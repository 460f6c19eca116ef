use std::path::Path;

use crate::Result;

/// The metrics of a model evaluated over a whole evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvalMetrics {
    pub global_step: u64,
    pub loss: f32,
    pub accuracy: f32,
    pub num_examples: usize,
}

/// An independent evaluation entry point over persisted checkpoints.
pub trait Evaluator: Send + Sync {
    /// Evaluates a checkpoint.
    ///
    /// # Arguments
    /// * `checkpoint_dir` - The training directory or a snapshot directory.
    /// * `batch_size` - The batch size of the evaluation stream.
    /// * `checkpoint_name` - A specific snapshot, the latest one when `None`.
    fn evaluate(
        &self,
        checkpoint_dir: &Path,
        batch_size: usize,
        checkpoint_name: Option<&str>,
    ) -> Result<EvalMetrics>;
}
