mod training;

pub use training::{DatasetConfig, LossConfig, OptimizerConfig, ScheduleConfig, TrainingConfig};
