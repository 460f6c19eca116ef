pub mod checkpoint;
pub mod configs;
pub mod context;
pub mod error;
pub mod evaluation;
pub mod summary;
pub mod training;

pub use checkpoint::{CheckpointIndex, CheckpointManager, CheckpointMetadata, Snapshot};
pub use configs::TrainingConfig;
pub use context::ExecutionContext;
pub use error::{CheckpointErr, TrainError};
pub use evaluation::CheckpointEvaluator;
pub use summary::{Histogram, MetricsReporter, SUMMARY_FILE, SummaryRecord};
pub use training::{LoopState, TerminalStatus, TrainingLoop, TrainingReport};
