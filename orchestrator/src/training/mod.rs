mod report;
mod training_loop;

pub use report::{LoopState, TerminalStatus, TrainingReport};
pub use training_loop::TrainingLoop;
