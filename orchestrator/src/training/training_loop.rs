use std::{path::Path, sync::Arc, time::Instant};

use log::{debug, error, info, warn};
use machine_learning::{Batch, EvalMetrics, Hooks};
use parameters::{LearningRateSchedule, MovingAverage, Optimizer, ParameterStore};
use towers::{DeviceSplitter, FeedPool, GradientReducer, TowerOutput, TowerRunner};

use super::{LoopState, TerminalStatus, TrainingReport};
use crate::{
    CheckpointManager, ExecutionContext, MetricsReporter, TrainError, configs::TrainingConfig,
};

type Store = ParameterStore<Box<dyn Optimizer + Send>>;

/// What the current run has done so far.
#[derive(Debug, Default)]
struct Progress {
    steps_run: u64,
    last_loss: Option<f32>,
    correct: usize,
    examples: usize,
}

impl Progress {
    fn accuracy(&self) -> f32 {
        if self.examples == 0 {
            return 0.;
        }

        self.correct as f32 / self.examples as f32
    }
}

/// The controller of a synchronous multi-device training run.
///
/// Every step pulls one snapshot of the parameters, runs one tower per device on it,
/// averages the tower gradients and applies them, and only then moves the shadows. The
/// next step can't start before the apply finished, so every tower of a step sees the
/// parameters of the same global step.
pub struct TrainingLoop {
    config: TrainingConfig,
    hooks: Hooks,
    store: Store,
    ema: MovingAverage,
    schedule: LearningRateSchedule,
    splitter: DeviceSplitter,
    towers: Vec<Arc<TowerRunner>>,
    reducer: GradientReducer,
    checkpoints: CheckpointManager,
    state: LoopState,
    last_checkpoint: Option<u64>,
}

impl TrainingLoop {
    /// Builds every component of the run, restoring `config.restore_path` if it's set.
    ///
    /// # Arguments
    /// * `config` - The training configuration.
    /// * `hooks` - The model, loss, data and evaluation collaborators.
    ///
    /// # Errors
    /// A `TrainError::Config` if the configuration is invalid or a restore was requested
    /// and there's nothing to restore from.
    pub fn new(config: TrainingConfig, hooks: Hooks) -> Result<Self, TrainError> {
        config.validate()?;

        let splitter = DeviceSplitter::new(config.batch_size.get(), config.num_devices.get())?;
        let optimizer = config.optimizer;
        let store = ParameterStore::new(hooks.network().parameters(), |len| {
            optimizer.build(len)
        })?;
        let ema = MovingAverage::new(config.moving_average_decay, &store)?;

        let towers = (0..splitter.num_devices())
            .map(|device| {
                let network = Arc::clone(hooks.network());
                let loss_fn = Arc::clone(hooks.loss_fn());
                Arc::new(TowerRunner::new(device, network, loss_fn))
            })
            .collect();

        debug!(
            num_params = store.len(), num_elements = store.num_elements(),
            num_devices = splitter.num_devices(), moving_average_decay = ema.decay();
            "built parameter store and towers"
        );

        let mut training = Self {
            schedule: config.learning_rate_schedule(),
            checkpoints: CheckpointManager::new(&config.train_dir),
            config,
            hooks,
            store,
            ema,
            splitter,
            towers,
            reducer: GradientReducer::new(),
            state: LoopState::Initializing,
            last_checkpoint: None,
        };

        if let Some(path) = training.config.restore_path.clone() {
            training.restore(&path)?;
        }

        Ok(training)
    }

    fn restore(&mut self, path: &Path) -> Result<(), TrainError> {
        if !path.exists() {
            return Err(TrainError::Config(format!(
                "restore path {} does not exist",
                path.display()
            )));
        }

        let snapshot = CheckpointManager::restore(path, None)?.ok_or_else(|| {
            TrainError::Config(format!("no valid checkpoint found in {}", path.display()))
        })?;

        let global_step = snapshot.metadata.global_step;
        self.store.restore(&snapshot.params, global_step)?;
        self.ema.restore(snapshot.shadows)?;
        let slots = self.store.load_optimizer_state(&snapshot.optimizer);
        self.last_checkpoint = Some(snapshot.metadata.step);

        info!(
            global_step = global_step, optimizer_slots = slots;
            "restored {}", snapshot.path.display()
        );
        Ok(())
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn global_step(&self) -> u64 {
        self.store.global_step()
    }

    pub fn store(&self) -> &ParameterStore<Box<dyn Optimizer + Send>> {
        &self.store
    }

    pub fn moving_average(&self) -> &MovingAverage {
        &self.ema
    }

    pub fn last_checkpoint(&self) -> Option<u64> {
        self.last_checkpoint
    }

    /// Trains until `max_steps`, an external stop, the end of the data or a fatal error.
    ///
    /// Every exit path stops the feed workers, waits for them and the summary writer, and
    /// logs the final status together with the last checkpointed step.
    ///
    /// # Arguments
    /// * `ctx` - The devices to run on and the stop signal to honor.
    ///
    /// # Returns
    /// The report of a run that ended normally, or `TrainError::Diverged` if the loss
    /// stopped being finite.
    pub async fn run(&mut self, ctx: &ExecutionContext) -> Result<TrainingReport, TrainError> {
        if self.state != LoopState::Initializing {
            return Err(TrainError::Config(format!(
                "the training loop already ran, it's {}",
                self.state
            )));
        }

        let res = self.run_inner(ctx).await;

        match &res {
            Ok(report) => {
                self.state = match report.status {
                    TerminalStatus::Completed => LoopState::Completed,
                    _ => LoopState::Stopping,
                };
                info!(
                    "training {} at global step {}, last checkpoint: {}",
                    report.status,
                    report.global_step,
                    describe(self.last_checkpoint)
                );
            }
            Err(e @ TrainError::Diverged { .. }) => {
                self.state = LoopState::Diverged;
                error!("{e}");
            }
            Err(e) => {
                self.state = LoopState::Failed;
                error!(
                    "training failed: {e}, last checkpoint: {}",
                    describe(self.last_checkpoint)
                );
            }
        }

        res
    }

    async fn run_inner(&mut self, ctx: &ExecutionContext) -> Result<TrainingReport, TrainError> {
        if ctx.num_devices() != self.splitter.num_devices() {
            return Err(TrainError::Config(format!(
                "the context has {} devices but the run is configured for {}",
                ctx.num_devices(),
                self.splitter.num_devices()
            )));
        }

        let mut reporter = MetricsReporter::new(
            self.checkpoints.train_dir(),
            self.config.histogram_buckets.get(),
        )?;
        let streams = self.splitter.open_streams(
            self.hooks.data().as_ref(),
            true,
            self.config.num_feed_threads.get(),
        )?;
        let mut feed = FeedPool::spawn(
            streams,
            self.config.queue_capacity.get(),
            self.config.wraparound,
            ctx.stop_token().child_token(),
        );

        self.state = LoopState::Running;
        info!(
            global_step = self.store.global_step(), max_steps = self.config.max_steps;
            "starting training in {}", self.checkpoints.train_dir().display()
        );

        let mut progress = Progress::default();
        let res = self.run_steps(ctx, &mut feed, &mut reporter, &mut progress).await;

        if res.is_ok() {
            self.state = LoopState::Stopping;
            self.final_checkpoint(&progress);
        }

        feed.shutdown().await;
        reporter.close();

        Ok(TrainingReport {
            status: res?,
            global_step: self.store.global_step(),
            steps_run: progress.steps_run,
            last_checkpoint: self.last_checkpoint,
            last_loss: progress.last_loss,
            accuracy: progress.accuracy(),
        })
    }

    async fn run_steps(
        &mut self,
        ctx: &ExecutionContext,
        feed: &mut FeedPool,
        reporter: &mut MetricsReporter,
        progress: &mut Progress,
    ) -> Result<TerminalStatus, TrainError> {
        while self.store.global_step() < self.config.max_steps {
            if ctx.should_stop() {
                info!(global_step = self.store.global_step(); "stop requested");
                return Ok(TerminalStatus::Stopped);
            }

            let Some(shards) = feed.next_shards().await else {
                if ctx.should_stop() {
                    info!(global_step = self.store.global_step(); "stop requested");
                    return Ok(TerminalStatus::Stopped);
                }

                info!(global_step = self.store.global_step(); "out of training data");
                return Ok(TerminalStatus::DataExhausted);
            };

            self.step(ctx, shards, reporter, progress).await?;
        }

        Ok(TerminalStatus::Completed)
    }

    /// Runs one synchronous step over one shard per device.
    async fn step(
        &mut self,
        ctx: &ExecutionContext,
        shards: Vec<Batch>,
        reporter: &mut MetricsReporter,
        progress: &mut Progress,
    ) -> Result<(), TrainError> {
        let step = self.store.global_step();
        let first_step = progress.steps_run == 0;
        let start = Instant::now();

        let params = Arc::new(self.store.pull_params()?);
        let outputs = ctx.pool().run_towers(&self.towers, params, shards).await?;

        let loss: f32 = outputs.iter().map(|output| output.loss).sum();
        if !loss.is_finite() || !outputs.iter().all(TowerOutput::is_finite) {
            return Err(TrainError::Diverged {
                step,
                loss,
                last_checkpoint: self.last_checkpoint,
            });
        }

        let mut tower_metrics = Vec::with_capacity(outputs.len());
        let mut gradients = Vec::with_capacity(outputs.len());
        for output in outputs {
            tower_metrics.push((output.loss, output.accuracy()));
            progress.correct += output.correct;
            progress.examples += output.examples;
            gradients.push(output.gradients);
        }

        let mean = self.reducer.reduce(&gradients)?;
        let learning_rate = self.schedule.learning_rate(step);
        let global_step = self.store.apply_gradients(&mean, learning_rate)?;
        let decay = self.ema.update(&self.store, global_step)?;

        progress.steps_run += 1;
        progress.last_loss = Some(loss);

        if step % self.config.log_every.get() == 0 {
            let duration = start.elapsed().as_secs_f64();
            let examples_per_sec = self.splitter.batch_size() as f64 / duration;
            let sec_per_batch = duration / self.splitter.num_devices() as f64;
            info!(
                "step {step}, loss = {loss:.2} ({examples_per_sec:.1} examples/sec; \
                 {sec_per_batch:.3} sec/batch)"
            );
        }

        if step % self.config.summary_every.get() == 0 {
            reporter.scalar("learning_rate", learning_rate);
            reporter.scalar("loss", loss);
            reporter.scalar("accuracy", progress.accuracy());
            reporter.scalar("moving_average_decay", decay);
            for (tower, &(tower_loss, tower_accuracy)) in self.towers.iter().zip(&tower_metrics) {
                reporter.scalar(format!("{}/loss", tower.scope()), tower_loss);
                reporter.scalar(format!("{}/accuracy", tower.scope()), tower_accuracy);
            }
            reporter.parameter_histograms(&self.store);
            reporter.flush(step);
        }

        // A run always checkpoints the first step it applies, fresh or restored.
        if first_step
            || step % self.config.checkpoint_every.get() == 0
            || step + 1 == self.config.max_steps
        {
            self.save_checkpoint(step, global_step);
        }

        Ok(())
    }

    /// Checkpoints the last completed step of a run that stopped early, unless it already was.
    fn final_checkpoint(&mut self, progress: &Progress) {
        if progress.steps_run == 0 {
            return;
        }

        let global_step = self.store.global_step();
        let step = global_step - 1;
        if self.last_checkpoint != Some(step) {
            self.save_checkpoint(step, global_step);
        }
    }

    /// Writes a checkpoint, a failure is logged and the previous checkpoint stays the latest.
    fn save_checkpoint(&mut self, step: u64, global_step: u64) {
        let res = self.store.pull_params().map_err(TrainError::from).and_then(|params| {
            let optimizer = self.store.optimizer_state();
            self.checkpoints
                .save(step, global_step, &params, self.ema.shadows(), &optimizer)
                .map_err(TrainError::from)
        });

        match res {
            Ok(path) => {
                info!(step = step; "saved checkpoint {}", path.display());
                self.last_checkpoint = Some(step);
            }
            Err(e) => warn!(step = step; "failed to save checkpoint: {e}"),
        }
    }

    /// Evaluates a checkpoint of this run's training directory.
    ///
    /// # Arguments
    /// * `batch_size` - The batch size of the evaluation stream.
    /// * `checkpoint_name` - A specific snapshot, the latest one when `None`.
    pub fn evaluate(
        &self,
        batch_size: usize,
        checkpoint_name: Option<&str>,
    ) -> Result<EvalMetrics, TrainError> {
        let metrics = self.hooks.evaluator().evaluate(
            self.checkpoints.train_dir(),
            batch_size,
            checkpoint_name,
        )?;

        info!(
            global_step = metrics.global_step, num_examples = metrics.num_examples;
            "evaluation loss = {:.4}, accuracy = {:.4}", metrics.loss, metrics.accuracy
        );
        Ok(metrics)
    }
}

fn describe(last_checkpoint: Option<u64>) -> String {
    match last_checkpoint {
        Some(step) => format!("step {step}"),
        None => "none".to_string(),
    }
}
