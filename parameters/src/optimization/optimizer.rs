use crate::{Result, StoreErr};

/// Defines the strategy for updating model parameters based on calculated gradients.
pub trait Optimizer {
    /// Updates the provided slice of weights using the reduced gradient.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate of the current step.
    /// * `grad` - A reference to the gradient of this parameter.
    /// * `params` - The weights to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, learning_rate: f32, grad: &[f32], params: &mut [f32])
    -> Result<()>;

    /// Exports the internal slots of the optimizer so they can be checkpointed.
    fn state(&self) -> Vec<(&'static str, Vec<f32>)> {
        Vec::new()
    }

    /// Loads a slot previously exported by `state`.
    fn load_state(&mut self, slot: &str, _values: &[f32]) -> Result<()> {
        Err(StoreErr::UnknownSlot(slot.to_string()))
    }
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn update_params(
        &mut self,
        learning_rate: f32,
        grad: &[f32],
        params: &mut [f32],
    ) -> Result<()> {
        (**self).update_params(learning_rate, grad, params)
    }

    fn state(&self) -> Vec<(&'static str, Vec<f32>)> {
        (**self).state()
    }

    fn load_state(&mut self, slot: &str, values: &[f32]) -> Result<()> {
        (**self).load_state(slot, values)
    }
}

/// Checks that `grad` and `params` hold the same amount of scalars.
pub(super) fn check_sizes(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(StoreErr::SizeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}

/// Copies `values` into an optimizer slot of the same size.
pub(super) fn load_slot(slot: &mut [f32], values: &[f32]) -> Result<()> {
    if slot.len() != values.len() {
        return Err(StoreErr::SizeMismatch {
            what: "optimizer slot",
            got: values.len(),
            expected: slot.len(),
        });
    }

    slot.copy_from_slice(values);
    Ok(())
}
