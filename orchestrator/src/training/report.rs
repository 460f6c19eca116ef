use std::fmt;

/// The lifecycle of a `TrainingLoop`.
///
/// `Initializing -> Running -> (Stopping | Diverged | Completed)`, with `Failed` for any
/// other fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Initializing,
    Running,
    /// Stopped before `max_steps`, either by request or because the data ran out.
    Stopping,
    Diverged,
    Completed,
    Failed,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Diverged => "diverged",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };

        f.write_str(name)
    }
}

/// Why a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    /// Reached `max_steps`.
    Completed,
    /// An external stop was requested.
    Stopped,
    /// The data feed ran out and wraparound is off.
    DataExhausted,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::DataExhausted => "data exhausted",
        };

        f.write_str(name)
    }
}

/// The outcome of a finished run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingReport {
    pub status: TerminalStatus,
    /// The global step once the run ended.
    pub global_step: u64,
    /// The amount of steps this run applied.
    pub steps_run: u64,
    /// The step of the last checkpoint that was written successfully.
    pub last_checkpoint: Option<u64>,
    /// The total loss of the last step.
    pub last_loss: Option<f32>,
    /// The accuracy over every example this run trained on.
    pub accuracy: f32,
}
