use std::{
    error::Error,
    fmt::{self, Display},
};

use machine_learning::MlErr;

/// The result type of the tower fan-out.
pub type Result<T> = std::result::Result<T, TowerErr>;

/// Errors returned when the per-tower gradients can't be averaged.
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceErr {
    Empty,
    ParameterUniverse {
        tower: usize,
    },
    ShapeMismatch {
        name: String,
        tower: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
}

impl Display for ReduceErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceErr::Empty => f.write_str("there are no tower gradients to reduce"),
            ReduceErr::ParameterUniverse { tower } => write!(
                f,
                "tower {tower} produced gradients for a different set of parameters than tower 0"
            ),
            ReduceErr::ShapeMismatch {
                name,
                tower,
                got,
                expected,
            } => write!(
                f,
                "tower {tower} produced a {got:?} gradient for `{name}`, expected {expected:?}"
            ),
        }
    }
}

impl Error for ReduceErr {}

/// Errors of splitting batches across devices and running the towers.
#[derive(Debug, Clone, PartialEq)]
pub enum TowerErr {
    NoDevices,
    IndivisibleBatch {
        batch_size: usize,
        num_devices: usize,
    },
    DeviceCount {
        got: usize,
        expected: usize,
    },
    Model {
        device: usize,
        source: MlErr,
    },
    GradientMismatch {
        device: usize,
        name: String,
    },
    DeviceLost(usize),
    Reduce(ReduceErr),
    Runtime(String),
}

impl Display for TowerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TowerErr::NoDevices => f.write_str("at least one device is required"),
            TowerErr::IndivisibleBatch {
                batch_size,
                num_devices,
            } => write!(
                f,
                "batch size {batch_size} is not divisible by the {num_devices} devices"
            ),
            TowerErr::DeviceCount { got, expected } => {
                write!(f, "got work for {got} devices, expected {expected}")
            }
            TowerErr::Model { device, source } => write!(f, "tower {device} failed: {source}"),
            TowerErr::GradientMismatch { device, name } => write!(
                f,
                "tower {device} returned a gradient for `{name}` that doesn't match the parameters"
            ),
            TowerErr::DeviceLost(device) => write!(f, "device {device} stopped responding"),
            TowerErr::Reduce(e) => write!(f, "{e}"),
            TowerErr::Runtime(reason) => write!(f, "device runtime error: {reason}"),
        }
    }
}

impl Error for TowerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TowerErr::Model { source, .. } => Some(source),
            TowerErr::Reduce(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ReduceErr> for TowerErr {
    fn from(value: ReduceErr) -> Self {
        Self::Reduce(value)
    }
}
