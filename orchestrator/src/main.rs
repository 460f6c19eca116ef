use std::{env, sync::Arc};

use anyhow::Context;
use log::{info, warn};
use machine_learning::{DataSource, Hooks, InMemoryDataset, Network, SoftmaxClassifier};
use orchestrator::{
    CheckpointEvaluator, ExecutionContext, TrainError, TrainingConfig, TrainingLoop,
};
use tokio::signal;

const WEIGHT_DECAY: f32 = 1e-4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match env::args().nth(1) {
        Some(path) => TrainingConfig::from_file(&path)
            .with_context(|| format!("failed to load the config at {path}"))?,
        None => {
            info!("no config given, using the defaults");
            TrainingConfig::default()
        }
    };

    let seed = config.seed.unwrap_or_default();
    let dataset = config.dataset;

    let data: Arc<dyn DataSource> = Arc::new(InMemoryDataset::synthetic(
        dataset.num_examples.get(),
        dataset.num_features.get(),
        dataset.num_classes.get(),
        seed,
    )?);
    let network: Arc<dyn Network> = Arc::new(
        SoftmaxClassifier::new(dataset.num_features.get(), dataset.num_classes.get(), seed)
            .with_weight_decay(WEIGHT_DECAY),
    );
    let loss_fn = config.loss.build();
    let evaluator = CheckpointEvaluator::new(network.clone(), loss_fn.clone(), data.clone());

    let hooks = Hooks::builder()
        .network(network)
        .loss_fn(loss_fn)
        .data(data)
        .evaluator(Arc::new(evaluator))
        .build()?;

    let batch_size = config.batch_size.get();
    let ctx = ExecutionContext::new(config.num_devices.get())?;
    let mut training = TrainingLoop::new(config, hooks)?;

    let stop = ctx.stop_token();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("received SIGINT, stopping after the current step");
            stop.cancel();
        }
    });

    match training.run(&ctx).await {
        Ok(report) => info!(
            steps_run = report.steps_run, accuracy = report.accuracy;
            "training {} at global step {}", report.status, report.global_step
        ),
        Err(e @ TrainError::Diverged { .. }) => return Err(e.into()),
        Err(e) => return Err(e).context("training failed"),
    }

    if training.last_checkpoint().is_some() {
        training.evaluate(batch_size, None)?;
    }

    Ok(())
}
