use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use log::{debug, warn};
use rayon::prelude::*;

use crate::{
    Result, StoreErr,
    optimization::Optimizer,
    storage::{GradientSet, ParameterDecl, ParameterSet, ParameterShard, TensorMap},
};

/// The primary storage of the trainable parameters and of the global step.
///
/// It's the single owner of the live parameter values: readers get owned snapshots
/// through `pull_params` and only `apply_gradients` writes, so a snapshot is always
/// consistent with exactly one global step.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    shards: Arc<[ParameterShard<O>]>,
    index: Arc<HashMap<String, usize>>,
    global_step: Arc<AtomicU64>,
    updating: Arc<AtomicBool>,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            shards: Arc::clone(&self.shards),
            index: Arc::clone(&self.index),
            global_step: Arc::clone(&self.global_step),
            updating: Arc::clone(&self.updating),
        }
    }
}

impl<O: Optimizer> ParameterStore<O> {
    /// Creates a new `ParameterStore` with its global step set to zero.
    ///
    /// # Arguments
    /// * `decls` - The declarations of every trainable parameter.
    /// * `optimizer_factory` - An `Optimizer` factory closure, called once per parameter
    ///   with the amount of scalars it holds.
    ///
    /// # Returns
    /// A new store, or an error if there are no declarations or a name is repeated.
    pub fn new<I, F>(decls: I, mut optimizer_factory: F) -> Result<Self>
    where
        I: IntoIterator<Item = ParameterDecl>,
        F: FnMut(usize) -> O,
    {
        let mut index = HashMap::new();
        let mut shards = Vec::new();

        for ParameterDecl { name, value } in decls {
            if index.contains_key(&name) {
                return Err(StoreErr::DuplicateParameter(name));
            }

            let optimizer = optimizer_factory(value.len());
            index.insert(name.clone(), shards.len());
            shards.push(ParameterShard::new(name, value, optimizer));
        }

        if shards.is_empty() {
            return Err(StoreErr::EmptyStore);
        }

        Ok(Self {
            shards: Arc::from(shards),
            index: Arc::new(index),
            global_step: Arc::new(AtomicU64::new(0)),
            updating: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the amount of named parameters in the storage.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Returns the total amount of scalars in the storage.
    pub fn num_elements(&self) -> usize {
        self.shards.iter().map(ParameterShard::len).sum()
    }

    /// Returns the parameter names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shards.iter().map(ParameterShard::name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.index.get(name).map(|&i| self.shards[i].shape())
    }

    /// The amount of optimizer applications that have completed.
    pub fn global_step(&self) -> u64 {
        self.global_step.load(Ordering::Acquire)
    }

    /// Gathers every parameter into an owned snapshot.
    pub fn pull_params(&self) -> Result<ParameterSet> {
        self.shards
            .iter()
            .map(|shard| Ok((shard.name().to_string(), shard.pull()?)))
            .collect()
    }

    /// Calls `f` with the name, shape and flat weights of every parameter, in declaration
    /// order, stopping at the first error.
    pub fn try_visit<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &[usize], &[f32]) -> Result<()>,
    {
        self.shards
            .iter()
            .try_for_each(|shard| shard.read(|weights| f(shard.name(), shard.shape(), weights)))
    }

    /// Checks that `tensors` holds exactly one tensor per stored parameter, with matching
    /// shapes.
    fn validate(&self, tensors: &TensorMap) -> Result<()> {
        if let Some(name) = tensors.names().find(|name| !self.index.contains_key(*name)) {
            return Err(StoreErr::UnknownParameter(name.to_string()));
        }

        self.shards.iter().try_for_each(|shard| {
            let tensor = tensors
                .get(shard.name())
                .ok_or_else(|| StoreErr::MissingTensor(shard.name().to_string()))?;
            shard.check(tensor)
        })
    }

    /// Exports the optimizer slots of every parameter, keyed by `<parameter>/<slot>`.
    pub fn optimizer_state(&self) -> BTreeMap<String, Vec<f32>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .optimizer_state()
                    .into_iter()
                    .map(|(slot, values)| (format!("{}/{slot}", shard.name()), values))
            })
            .collect()
    }

    /// Loads previously exported optimizer slots.
    ///
    /// This is best-effort: slots that don't belong to any parameter, or that the optimizer
    /// rejects, are logged and skipped so training can resume with fresh optimizer state.
    ///
    /// # Returns
    /// The amount of slots that were loaded.
    pub fn load_optimizer_state(&self, state: &BTreeMap<String, Vec<f32>>) -> usize {
        let mut loaded = 0;

        for (key, values) in state {
            let Some((name, slot)) = key.rsplit_once('/') else {
                warn!(key = key.as_str(); "skipping malformed optimizer slot");
                continue;
            };

            let Some(&i) = self.index.get(name) else {
                warn!(key = key.as_str(); "skipping optimizer slot of an unknown parameter");
                continue;
            };

            match self.shards[i].load_optimizer_slot(slot, values) {
                Ok(()) => loaded += 1,
                Err(e) => warn!(key = key.as_str(); "skipping optimizer slot: {e}"),
            }
        }

        loaded
    }
}

impl<O: Optimizer + Send> ParameterStore<O> {
    /// Applies one optimizer step and increments the global step.
    ///
    /// Every gradient is validated before any parameter is touched, so a rejected update
    /// leaves both the parameters and the global step as they were.
    ///
    /// # Arguments
    /// * `grads` - The reduced gradient, one tensor per stored parameter.
    /// * `learning_rate` - The learning rate for this step.
    ///
    /// # Returns
    /// The new global step.
    pub fn apply_gradients(&self, grads: &GradientSet, learning_rate: f32) -> Result<u64> {
        self.validate(grads)?;

        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(StoreErr::ConcurrentUpdate);
        }

        let res = self.shards.par_iter().try_for_each(|shard| {
            let grad = grads
                .get(shard.name())
                .ok_or_else(|| StoreErr::MissingTensor(shard.name().to_string()))?;
            shard.update_weights(learning_rate, grad)
        });

        let res = res.map(|()| self.global_step.fetch_add(1, Ordering::AcqRel) + 1);
        self.updating.store(false, Ordering::Release);

        if let Ok(step) = res {
            debug!(global_step = step, learning_rate = learning_rate; "applied gradients");
        }

        res
    }

    /// Overwrites every parameter and the global step, as when restoring a checkpoint.
    ///
    /// # Arguments
    /// * `params` - One tensor per stored parameter, with matching shapes.
    /// * `global_step` - The global step the parameters belong to.
    pub fn restore(&self, params: &ParameterSet, global_step: u64) -> Result<()> {
        self.validate(params)?;

        self.shards.par_iter().try_for_each(|shard| {
            let value = params
                .get(shard.name())
                .ok_or_else(|| StoreErr::MissingTensor(shard.name().to_string()))?;
            shard.overwrite(value)
        })?;

        self.global_step.store(global_step, Ordering::Release);
        Ok(())
    }
}
