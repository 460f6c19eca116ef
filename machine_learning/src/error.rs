use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    MissingHook(&'static str),
    NoParameters,
    NoClasses,
    DuplicateParameter(String),
    MissingParameter(String),
    InvalidParameter {
        name: String,
        shape: Vec<usize>,
    },
    LabelOutOfRange {
        label: usize,
        num_classes: usize,
    },
    InvalidBatchSize(usize),
    EmptyDataset,
    Evaluation(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MlErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => {
                format!(
                    "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
                )
            }
            MlErr::MissingHook(hook) => format!("The `{hook}` hook was never provided"),
            MlErr::NoParameters => "The network declares no trainable parameters".to_string(),
            MlErr::NoClasses => "The network must predict at least one class".to_string(),
            MlErr::DuplicateParameter(name) => {
                format!("The network declares the parameter `{name}` more than once")
            }
            MlErr::MissingParameter(name) => {
                format!("The parameter `{name}` is missing from the snapshot")
            }
            MlErr::InvalidParameter { name, shape } => {
                format!("The parameter `{name}` has an unexpected shape {shape:?}")
            }
            MlErr::LabelOutOfRange { label, num_classes } => {
                format!("The label {label} is out of range for {num_classes} classes")
            }
            MlErr::InvalidBatchSize(size) => format!("Invalid batch size {size}"),
            MlErr::EmptyDataset => "The dataset holds no examples".to_string(),
            MlErr::Evaluation(reason) => format!("Evaluation failed: {reason}"),
        };

        write!(f, "{s}")
    }
}

impl Error for MlErr {}
