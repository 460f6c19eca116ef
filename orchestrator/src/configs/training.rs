use std::{
    fs,
    num::{NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    sync::Arc,
};

use machine_learning::{LossFn, Mse, SoftmaxCrossEntropy};
use parameters::{
    Adam, GradientDescent, GradientDescentWithMomentum, LearningRateSchedule, Optimizer,
};
use serde::{Deserialize, Serialize};

use crate::TrainError;

/// The loss the towers minimize over the network outputs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossConfig {
    #[default]
    SoftmaxCrossEntropy,
    /// Squared error against the one-hot labels.
    Mse,
}

impl LossConfig {
    pub fn build(&self) -> Arc<dyn LossFn> {
        match self {
            Self::SoftmaxCrossEntropy => Arc::new(SoftmaxCrossEntropy),
            Self::Mse => Arc::new(Mse::new()),
        }
    }
}

/// The optimizer applied to the reduced gradients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam { beta1: f32, beta2: f32, epsilon: f32 },
    GradientDescent,
    GradientDescentWithMomentum { momentum: f32 },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Builds an optimizer sized for a parameter of `len` scalars.
    pub fn build(&self, len: usize) -> Box<dyn Optimizer + Send> {
        match *self {
            Self::Adam {
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(len, beta1, beta2, epsilon)),
            Self::GradientDescent => Box::new(GradientDescent::new()),
            Self::GradientDescentWithMomentum { momentum } => {
                Box::new(GradientDescentWithMomentum::new(len, momentum))
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Adam {
                beta1,
                beta2,
                epsilon,
            } => {
                if !(0. ..1.).contains(&beta1) || !(0. ..1.).contains(&beta2) {
                    return Err(format!("adam betas must be in [0, 1), got {beta1} and {beta2}"));
                }
                if !(epsilon > 0.) {
                    return Err(format!("adam epsilon must be positive, got {epsilon}"));
                }
            }
            Self::GradientDescent => {}
            Self::GradientDescentWithMomentum { momentum } => {
                if !(0. ..1.).contains(&momentum) {
                    return Err(format!("momentum must be in [0, 1), got {momentum}"));
                }
            }
        }

        Ok(())
    }
}

/// How the learning rate evolves with the global step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Constant {
        learning_rate: f32,
    },
    ExponentialDecay {
        initial: f32,
        decay_rate: f32,
        decay_steps: NonZeroU64,
        staircase: bool,
    },
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::from(LearningRateSchedule::default())
    }
}

impl From<LearningRateSchedule> for ScheduleConfig {
    fn from(schedule: LearningRateSchedule) -> Self {
        match schedule {
            LearningRateSchedule::Constant(learning_rate) => Self::Constant { learning_rate },
            LearningRateSchedule::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
                staircase,
            } => Self::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
                staircase,
            },
        }
    }
}

impl From<ScheduleConfig> for LearningRateSchedule {
    fn from(config: ScheduleConfig) -> Self {
        match config {
            ScheduleConfig::Constant { learning_rate } => Self::Constant(learning_rate),
            ScheduleConfig::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
                staircase,
            } => Self::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
                staircase,
            },
        }
    }
}

impl ScheduleConfig {
    fn validate(&self) -> Result<(), String> {
        let (rate, decay) = match *self {
            Self::Constant { learning_rate } => (learning_rate, 1.),
            Self::ExponentialDecay {
                initial,
                decay_rate,
                ..
            } => (initial, decay_rate),
        };

        if !(rate.is_finite() && rate > 0.) {
            return Err(format!("the learning rate must be positive, got {rate}"));
        }
        if !(decay.is_finite() && decay > 0.) {
            return Err(format!("the decay rate must be positive, got {decay}"));
        }

        Ok(())
    }
}

/// The synthetic dataset trained on by the `helium-train` binary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub num_examples: NonZeroUsize,
    pub num_features: NonZeroUsize,
    pub num_classes: NonZeroUsize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_examples: NonZeroUsize::new(4096).unwrap_or(NonZeroUsize::MIN),
            num_features: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            num_classes: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// Everything a training run is configured with.
///
/// Every field has a default, so a JSON file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Where checkpoints and summaries are written.
    pub train_dir: PathBuf,
    /// A training directory or snapshot directory to resume from.
    pub restore_path: Option<PathBuf>,
    /// Training stops once the global step reaches this value.
    pub max_steps: u64,
    /// The global batch size, split evenly across the devices.
    pub batch_size: NonZeroUsize,
    pub num_devices: NonZeroUsize,
    pub num_feed_threads: NonZeroUsize,
    /// Batches buffered per device by the feed workers.
    pub queue_capacity: NonZeroUsize,
    /// Restart exhausted data streams instead of stopping.
    pub wraparound: bool,
    pub log_every: NonZeroU64,
    pub summary_every: NonZeroU64,
    pub checkpoint_every: NonZeroU64,
    pub histogram_buckets: NonZeroUsize,
    pub moving_average_decay: f32,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,
    pub schedule: ScheduleConfig,
    pub dataset: DatasetConfig,
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        let nz = |n| NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN);
        let nz64 = |n| NonZeroU64::new(n).unwrap_or(NonZeroU64::MIN);

        Self {
            train_dir: PathBuf::from("/tmp/helium/train"),
            restore_path: None,
            max_steps: 10_000,
            batch_size: nz(32),
            num_devices: nz(1),
            num_feed_threads: nz(4),
            queue_capacity: nz(16),
            wraparound: true,
            log_every: nz64(1),
            summary_every: nz64(10),
            checkpoint_every: nz64(1000),
            histogram_buckets: nz(30),
            moving_average_decay: parameters::averaging::DEFAULT_DECAY,
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            dataset: DatasetConfig::default(),
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Loads a config from a JSON file and validates it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| TrainError::Config(format!("{}: {e}", path.display())))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks the values serde can't check on its own.
    pub fn validate(&self) -> Result<(), TrainError> {
        self.check().map_err(TrainError::Config)
    }

    fn check(&self) -> Result<(), String> {
        let batch_size = self.batch_size.get();
        let num_devices = self.num_devices.get();

        if batch_size % num_devices != 0 {
            return Err(format!(
                "batch size {batch_size} is not divisible by the {num_devices} devices"
            ));
        }
        if self.max_steps == 0 {
            return Err("max_steps must be positive".to_string());
        }
        if !(0. ..1.).contains(&self.moving_average_decay) {
            return Err(format!(
                "moving_average_decay must be in [0, 1), got {}",
                self.moving_average_decay
            ));
        }
        if self.train_dir.as_os_str().is_empty() {
            return Err("train_dir must not be empty".to_string());
        }

        self.optimizer.validate()?;
        self.schedule.validate()
    }

    /// The learning rate schedule built from `schedule`.
    pub fn learning_rate_schedule(&self) -> LearningRateSchedule {
        self.schedule.into()
    }
}
