use std::borrow::Cow;

use ndarray::{ArrayD, IxDyn};
use parking_lot::{Mutex, RwLock};

use crate::{Result, StoreErr, optimization::Optimizer};

/// A single named parameter together with the optimizer state that updates it.
#[derive(Debug)]
pub struct ParameterShard<O: Optimizer> {
    name: String,
    shape: Box<[usize]>,
    weights: RwLock<Box<[f32]>>,
    optimizer: Mutex<O>,
}

impl<O: Optimizer> ParameterShard<O> {
    /// Creates a new `ParameterShard`.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    /// * `value` - The initial state of the weights.
    /// * `optimizer` - The optimization algorithm, sized for `value.len()` parameters.
    pub fn new(name: String, value: ArrayD<f32>, optimizer: O) -> Self {
        let shape = value.shape().into();
        let weights = value.iter().copied().collect::<Vec<_>>().into_boxed_slice();

        Self {
            name,
            shape,
            weights: RwLock::new(weights),
            optimizer: Mutex::new(optimizer),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Checks that `tensor` has exactly the shape of this parameter.
    pub fn check(&self, tensor: &ArrayD<f32>) -> Result<()> {
        if tensor.shape() != &*self.shape {
            return Err(StoreErr::ShapeMismatch {
                name: self.name.clone(),
                got: tensor.shape().to_vec(),
                expected: self.shape.to_vec(),
            });
        }

        Ok(())
    }

    /// Updates the weights with `grad` through the optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The learning rate of the current step.
    /// * `grad` - The gradient for this parameter, must have the same shape.
    pub fn update_weights(&self, learning_rate: f32, grad: &ArrayD<f32>) -> Result<()> {
        self.check(grad)?;
        let grad = flatten(grad);

        let mut weights = self.weights.write();
        self.optimizer
            .lock()
            .update_params(learning_rate, &grad, &mut weights)
    }

    /// Copies the weights out into a tensor with this parameter's shape.
    pub fn pull(&self) -> Result<ArrayD<f32>> {
        let weights = self.weights.read().to_vec();
        let len = weights.len();

        ArrayD::from_shape_vec(IxDyn(&self.shape), weights).map_err(|_| StoreErr::SizeMismatch {
            what: "parameter buffer",
            got: len,
            expected: self.len(),
        })
    }

    /// Runs `f` with read access to the flat weights.
    pub fn read<R>(&self, f: impl FnOnce(&[f32]) -> R) -> R {
        f(&self.weights.read())
    }

    /// Replaces the weights with the contents of `tensor`.
    pub fn overwrite(&self, tensor: &ArrayD<f32>) -> Result<()> {
        self.check(tensor)?;

        let mut weights = self.weights.write();
        weights
            .iter_mut()
            .zip(tensor.iter())
            .for_each(|(w, v)| *w = *v);

        Ok(())
    }

    pub fn optimizer_state(&self) -> Vec<(&'static str, Vec<f32>)> {
        self.optimizer.lock().state()
    }

    pub fn load_optimizer_slot(&self, slot: &str, values: &[f32]) -> Result<()> {
        self.optimizer.lock().load_state(slot, values)
    }
}

/// Borrows the tensor as a flat slice in logical order, copying only when its memory
/// layout isn't standard.
fn flatten(tensor: &ArrayD<f32>) -> Cow<'_, [f32]> {
    match tensor.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(tensor.iter().copied().collect()),
    }
}
