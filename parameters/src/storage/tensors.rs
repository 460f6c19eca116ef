use std::collections::{BTreeMap, btree_map};

use ndarray::ArrayD;

/// A named collection of tensors, iterated in lexicographic name order.
///
/// The fixed ordering keeps every reduction over a set deterministic, regardless of the
/// order the tensors were inserted in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorMap {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

/// A step-consistent snapshot of every trainable parameter.
pub type ParameterSet = TensorMap;

/// The gradient of the loss with respect to each trainable parameter.
pub type GradientSet = TensorMap;

impl TensorMap {
    /// Creates a new empty `TensorMap`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a tensor, returning the previous one with the same name if any.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Returns the names in iteration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<f32>> {
        self.tensors.iter()
    }

    /// Total amount of scalars across every tensor.
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// Returns `true` if every scalar of every tensor is finite.
    pub fn is_finite(&self) -> bool {
        self.tensors
            .values()
            .all(|tensor| tensor.iter().all(|x| x.is_finite()))
    }
}

impl FromIterator<(String, ArrayD<f32>)> for TensorMap {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for TensorMap {
    type Item = (String, ArrayD<f32>);
    type IntoIter = btree_map::IntoIter<String, ArrayD<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl<'a> IntoIterator for &'a TensorMap {
    type Item = (&'a String, &'a ArrayD<f32>);
    type IntoIter = btree_map::Iter<'a, String, ArrayD<f32>>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.iter()
    }
}

/// The declaration of a trainable parameter: its unique name and its initial value.
#[derive(Debug, Clone)]
pub struct ParameterDecl {
    pub name: String,
    pub value: ArrayD<f32>,
}

impl ParameterDecl {
    /// Creates a new `ParameterDecl`.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    /// * `value` - The initial value, its shape is fixed for the lifetime of the parameter.
    pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}
