pub mod error;
pub mod feed;
pub mod pool;
pub mod reduce;
pub mod split;
pub mod tower;

pub use error::{ReduceErr, Result, TowerErr};
pub use feed::FeedPool;
pub use pool::DevicePool;
pub use reduce::GradientReducer;
pub use split::DeviceSplitter;
pub use tower::{TowerOutput, TowerRunner};
