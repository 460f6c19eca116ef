mod manager;
mod metadata;

pub use manager::{CHECKPOINT_PREFIX, CheckpointManager, Snapshot};
pub use metadata::{CheckpointIndex, CheckpointMetadata};
