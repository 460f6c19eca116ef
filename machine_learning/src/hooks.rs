use std::{collections::HashSet, fmt, sync::Arc};

use crate::{DataSource, Evaluator, LossFn, MlErr, Network, Result};

/// The capabilities a training run needs from its model and data.
#[derive(Clone)]
pub struct Hooks {
    network: Arc<dyn Network>,
    loss_fn: Arc<dyn LossFn>,
    data: Arc<dyn DataSource>,
    evaluator: Arc<dyn Evaluator>,
}

impl Hooks {
    /// Returns a builder with no hook set.
    pub fn builder() -> HooksBuilder {
        HooksBuilder::default()
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn loss_fn(&self) -> &Arc<dyn LossFn> {
        &self.loss_fn
    }

    pub fn data(&self) -> &Arc<dyn DataSource> {
        &self.data
    }

    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.evaluator
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("num_classes", &self.network.num_classes())
            .finish_non_exhaustive()
    }
}

/// Builds `Hooks`, checking every capability was provided.
#[derive(Default)]
pub struct HooksBuilder {
    network: Option<Arc<dyn Network>>,
    loss_fn: Option<Arc<dyn LossFn>>,
    data: Option<Arc<dyn DataSource>>,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl HooksBuilder {
    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn loss_fn(mut self, loss_fn: Arc<dyn LossFn>) -> Self {
        self.loss_fn = Some(loss_fn);
        self
    }

    pub fn data(mut self, data: Arc<dyn DataSource>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Builds the `Hooks`.
    ///
    /// # Returns
    /// The hooks, or an error naming the first missing hook or describing why the
    /// network's declarations are unusable.
    pub fn build(self) -> Result<Hooks> {
        let network = self.network.ok_or(MlErr::MissingHook("network"))?;
        let loss_fn = self.loss_fn.ok_or(MlErr::MissingHook("loss_fn"))?;
        let data = self.data.ok_or(MlErr::MissingHook("data"))?;
        let evaluator = self.evaluator.ok_or(MlErr::MissingHook("evaluator"))?;

        validate_network(network.as_ref())?;

        Ok(Hooks {
            network,
            loss_fn,
            data,
            evaluator,
        })
    }
}

fn validate_network(network: &dyn Network) -> Result<()> {
    if network.num_classes() == 0 {
        return Err(MlErr::NoClasses);
    }

    let decls = network.parameters();
    if decls.is_empty() {
        return Err(MlErr::NoParameters);
    }

    let mut seen = HashSet::new();
    for decl in decls {
        if !seen.insert(decl.name.clone()) {
            return Err(MlErr::DuplicateParameter(decl.name));
        }
    }

    Ok(())
}
