use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for the parameter storage and its optimizers.
pub type Result<T> = std::result::Result<T, StoreErr>;

/// Errors returned whenever a gradient, parameter snapshot or optimizer slot doesn't
/// agree with what the `ParameterStore` holds.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreErr {
    EmptyStore,
    DuplicateParameter(String),
    UnknownParameter(String),
    MissingTensor(String),
    ShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    UnknownSlot(String),
    ConcurrentUpdate,
}

impl Display for StoreErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreErr::EmptyStore => f.write_str("the store must hold at least one parameter"),
            StoreErr::DuplicateParameter(name) => {
                write!(f, "parameter `{name}` was declared more than once")
            }
            StoreErr::UnknownParameter(name) => {
                write!(f, "tensor `{name}` doesn't match any stored parameter")
            }
            StoreErr::MissingTensor(name) => write!(f, "no tensor was given for parameter `{name}`"),
            StoreErr::ShapeMismatch {
                name,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for `{name}`: got {got:?}, expected {expected:?}"
            ),
            StoreErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch for {what}: got {got}, expected {expected}"),
            StoreErr::UnknownSlot(slot) => write!(f, "unknown optimizer slot `{slot}`"),
            StoreErr::ConcurrentUpdate => {
                f.write_str("another optimizer update is already being applied")
            }
        }
    }
}

impl Error for StoreErr {}
