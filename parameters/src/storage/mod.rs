mod shard;
mod store;
mod tensors;

pub(super) use shard::ParameterShard;
pub use store::ParameterStore;
pub use tensors::{GradientSet, ParameterDecl, ParameterSet, TensorMap};
