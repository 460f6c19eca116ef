pub mod averaging;
pub mod error;
pub mod optimization;
pub mod storage;

pub use averaging::{DEFAULT_DECAY, MovingAverage};
pub use error::{Result, StoreErr};
pub use optimization::{
    Adam, GradientDescent, GradientDescentWithMomentum, LearningRateSchedule, Optimizer,
};
pub use storage::{GradientSet, ParameterDecl, ParameterSet, ParameterStore, TensorMap};
