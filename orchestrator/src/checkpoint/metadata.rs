use serde::{Deserialize, Serialize};

/// Written next to the tensors of every snapshot as `metadata.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// The index of the training step the snapshot was taken after.
    pub step: u64,
    /// The amount of optimizer applications the parameters include.
    pub global_step: u64,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub num_params: usize,
    pub num_shadows: usize,
    pub num_optimizer_slots: usize,
}

/// The `checkpoint` index file of a training directory.
///
/// Paths are snapshot directory names relative to the training directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointIndex {
    pub model_checkpoint_path: String,
    pub step: u64,
    pub global_step: u64,
    #[serde(default)]
    pub all_model_checkpoint_paths: Vec<String>,
}
