use std::{fmt, io, path::PathBuf};

use machine_learning::MlErr;
use parameters::StoreErr;
use towers::{ReduceErr, TowerErr};

/// Errors of writing or reading checkpoints.
#[derive(Debug)]
pub enum CheckpointErr {
    Io {
        path: PathBuf,
        source: io::Error,
    },
    Metadata {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// The tensor payload couldn't be encoded or decoded.
    Tensors {
        path: PathBuf,
        reason: String,
    },
}

impl CheckpointErr {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn metadata(path: impl Into<PathBuf>) -> impl FnOnce(serde_json::Error) -> Self {
        let path = path.into();
        move |source| Self::Metadata { path, source }
    }

    pub(crate) fn tensors(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Tensors {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CheckpointErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "checkpoint io error at {}: {source}", path.display())
            }
            Self::Metadata { path, source } => {
                write!(f, "invalid checkpoint metadata at {}: {source}", path.display())
            }
            Self::Tensors { path, reason } => {
                write!(f, "invalid checkpoint tensors at {}: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for CheckpointErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Metadata { source, .. } => Some(source),
            Self::Tensors { .. } => None,
        }
    }
}

/// All errors that can end a training run.
#[derive(Debug)]
pub enum TrainError {
    /// Invalid configuration, caught before or while initializing.
    Config(String),
    /// The loss became NaN or infinite. No checkpoint is written for `step`.
    Diverged {
        step: u64,
        loss: f32,
        last_checkpoint: Option<u64>,
    },
    Store(StoreErr),
    Model(MlErr),
    Tower(TowerErr),
    Checkpoint(CheckpointErr),
    Io(io::Error),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "invalid config: {msg}"),
            Self::Diverged {
                step,
                loss,
                last_checkpoint,
            } => {
                write!(f, "model diverged with loss = {loss} at step {step}")?;
                match last_checkpoint {
                    Some(last) => write!(f, ", last checkpoint at step {last}"),
                    None => write!(f, ", no checkpoint was written"),
                }
            }
            Self::Store(e) => write!(f, "parameter store error: {e}"),
            Self::Model(e) => write!(f, "model error: {e}"),
            Self::Tower(e) => write!(f, "tower error: {e}"),
            Self::Checkpoint(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Model(e) => Some(e),
            Self::Tower(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Config(_) | Self::Diverged { .. } => None,
        }
    }
}

impl From<StoreErr> for TrainError {
    fn from(e: StoreErr) -> Self {
        Self::Store(e)
    }
}

impl From<MlErr> for TrainError {
    fn from(e: MlErr) -> Self {
        Self::Model(e)
    }
}

impl From<TowerErr> for TrainError {
    fn from(e: TowerErr) -> Self {
        match e {
            TowerErr::NoDevices | TowerErr::IndivisibleBatch { .. } | TowerErr::Reduce(_) => {
                Self::Config(e.to_string())
            }
            e => Self::Tower(e),
        }
    }
}

impl From<ReduceErr> for TrainError {
    fn from(e: ReduceErr) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<CheckpointErr> for TrainError {
    fn from(e: CheckpointErr) -> Self {
        Self::Checkpoint(e)
    }
}

impl From<io::Error> for TrainError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
