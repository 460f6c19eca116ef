pub mod arch;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod hooks;
pub mod utils;

pub use arch::{
    Forward, Network, SoftmaxClassifier,
    loss::{LossFn, Mse, SoftmaxCrossEntropy},
};
pub use dataset::{Batch, BatchStream, DataSource, InMemoryDataset};
pub use error::{MlErr, Result};
pub use evaluation::{EvalMetrics, Evaluator};
pub use hooks::{Hooks, HooksBuilder};
