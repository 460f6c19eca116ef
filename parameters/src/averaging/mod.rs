mod moving_average;

pub use moving_average::{DEFAULT_DECAY, MovingAverage};
