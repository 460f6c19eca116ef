use std::num::NonZeroU64;

/// Maps the global step to the learning rate used for that step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRateSchedule {
    Constant(f32),
    /// `initial * decay_rate ^ (step / decay_steps)`, the exponent is floored when
    /// `staircase` is set.
    ExponentialDecay {
        initial: f32,
        decay_rate: f32,
        decay_steps: NonZeroU64,
        staircase: bool,
    },
}

impl LearningRateSchedule {
    /// Returns the learning rate for the given global step.
    pub fn learning_rate(&self, step: u64) -> f32 {
        match *self {
            Self::Constant(lr) => lr,
            Self::ExponentialDecay {
                initial,
                decay_rate,
                decay_steps,
                staircase,
            } => {
                let decay_steps = decay_steps.get();
                let exponent = if staircase {
                    (step / decay_steps) as f64
                } else {
                    step as f64 / decay_steps as f64
                };

                (initial as f64 * (decay_rate as f64).powf(exponent)) as f32
            }
        }
    }
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        Self::ExponentialDecay {
            initial: 1e-3,
            decay_rate: 0.1,
            decay_steps: NonZeroU64::new(350_000).unwrap_or(NonZeroU64::MIN),
            staircase: true,
        }
    }
}
