use std::{
    fs,
    io::{BufRead, BufReader},
    num::{NonZeroU64, NonZeroUsize},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use machine_learning::{
    DataSource, Forward, Hooks, InMemoryDataset, LossFn, Network, Result as MlResult,
    SoftmaxClassifier, SoftmaxCrossEntropy,
};
use ndarray::ArrayView2;
use orchestrator::{
    CheckpointEvaluator, CheckpointManager, ExecutionContext, LoopState, SUMMARY_FILE,
    SummaryRecord, TerminalStatus, TrainError, TrainingConfig, TrainingLoop,
    configs::{LossConfig, OptimizerConfig, ScheduleConfig},
};
use parameters::{GradientSet, ParameterDecl, ParameterSet};

const NUM_FEATURES: usize = 8;
const NUM_CLASSES: usize = 4;
const SEED: u64 = 11;

/// A classifier whose forward pass returns NaN logits on one specific call.
struct FlakyNetwork {
    inner: SoftmaxClassifier,
    calls: AtomicUsize,
    nan_at: usize,
}

impl Network for FlakyNetwork {
    fn parameters(&self) -> Vec<ParameterDecl> {
        self.inner.parameters()
    }

    fn num_classes(&self) -> usize {
        self.inner.num_classes()
    }

    fn forward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        num_classes: usize,
        is_training: bool,
    ) -> MlResult<Forward> {
        let mut forward = self.inner.forward(params, inputs, num_classes, is_training)?;

        if self.calls.fetch_add(1, Ordering::SeqCst) == self.nan_at {
            forward.logits.fill(f32::NAN);
        }

        Ok(forward)
    }

    fn backward(
        &self,
        params: &ParameterSet,
        inputs: ArrayView2<f32>,
        forward: &Forward,
        grad_logits: ArrayView2<f32>,
    ) -> MlResult<GradientSet> {
        self.inner.backward(params, inputs, forward, grad_logits)
    }
}

fn classifier() -> SoftmaxClassifier {
    SoftmaxClassifier::new(NUM_FEATURES, NUM_CLASSES, SEED)
}

fn hooks(network: Arc<dyn Network>, num_examples: usize) -> Hooks {
    hooks_with_loss(network, num_examples, Arc::new(SoftmaxCrossEntropy))
}

fn hooks_with_loss(
    network: Arc<dyn Network>,
    num_examples: usize,
    loss_fn: Arc<dyn LossFn>,
) -> Hooks {
    let data: Arc<dyn DataSource> = Arc::new(
        InMemoryDataset::synthetic(num_examples, NUM_FEATURES, NUM_CLASSES, SEED).unwrap(),
    );
    let evaluator = CheckpointEvaluator::new(network.clone(), loss_fn.clone(), data.clone());

    Hooks::builder()
        .network(network)
        .loss_fn(loss_fn)
        .data(data)
        .evaluator(Arc::new(evaluator))
        .build()
        .unwrap()
}

fn config(
    train_dir: &Path,
    max_steps: u64,
    batch_size: usize,
    num_devices: usize,
) -> TrainingConfig {
    TrainingConfig {
        train_dir: train_dir.to_path_buf(),
        max_steps,
        batch_size: NonZeroUsize::new(batch_size).unwrap(),
        num_devices: NonZeroUsize::new(num_devices).unwrap(),
        num_feed_threads: NonZeroUsize::new(1).unwrap(),
        queue_capacity: NonZeroUsize::new(4).unwrap(),
        optimizer: OptimizerConfig::GradientDescent,
        schedule: ScheduleConfig::Constant {
            learning_rate: 0.01,
        },
        seed: Some(SEED),
        ..Default::default()
    }
}

fn checkpoint_steps(train_dir: &Path) -> Vec<u64> {
    CheckpointManager::new(train_dir)
        .list()
        .unwrap()
        .into_iter()
        .map(|(step, _)| step)
        .collect()
}

fn read_summaries(train_dir: &Path) -> Vec<SummaryRecord> {
    let file = fs::File::open(train_dir.join(SUMMARY_FILE)).unwrap();
    BufReader::new(file)
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thousand_steps_on_one_device() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::new(1).unwrap();
    let mut training =
        TrainingLoop::new(config(dir.path(), 1000, 32, 1), hooks(Arc::new(classifier()), 256))
            .unwrap();

    let report = training.run(&ctx).await.unwrap();

    assert_eq!(report.status, TerminalStatus::Completed);
    assert_eq!(report.global_step, 1000);
    assert_eq!(report.steps_run, 1000);
    assert_eq!(report.last_checkpoint, Some(999));
    assert!(report.last_loss.unwrap().is_finite());
    assert_eq!(training.state(), LoopState::Completed);

    assert_eq!(checkpoint_steps(dir.path()), vec![0, 999]);
    let index = CheckpointManager::new(dir.path()).index().unwrap();
    assert_eq!(index.step, 999);
    assert_eq!(index.global_step, 1000);

    let summaries = read_summaries(dir.path());
    assert_eq!(summaries.len(), 100);
    assert!(summaries.iter().zip((0..).step_by(10)).all(|(s, step)| s.step == step));

    let first = &summaries[0];
    let expected = [
        "learning_rate",
        "loss",
        "accuracy",
        "moving_average_decay",
        "tower_0/loss",
        "tower_0/accuracy",
    ];
    for scalar in expected {
        assert!(first.scalars.contains_key(scalar), "missing {scalar}");
    }
    assert_eq!(first.scalars["learning_rate"], 0.01);
    assert!((0. ..=1.).contains(&first.scalars["tower_0/accuracy"]));
    let last = summaries.last().unwrap();
    assert!(last.scalars["moving_average_decay"] > first.scalars["moving_average_decay"]);
    assert_eq!(first.histograms["softmax/weights"].count, NUM_FEATURES * NUM_CLASSES);
    assert_eq!(first.histograms["softmax/biases"].count, NUM_CLASSES);

    let metrics = training.evaluate(32, None).unwrap();
    assert_eq!(metrics.global_step, 1000);
    assert_eq!(metrics.num_examples, 256);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_divergence_halts_without_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let network = FlakyNetwork {
        inner: classifier(),
        calls: AtomicUsize::new(0),
        nan_at: 5,
    };

    let ctx = ExecutionContext::new(1).unwrap();
    let mut training =
        TrainingLoop::new(config(dir.path(), 100, 16, 1), hooks(Arc::new(network), 128)).unwrap();

    let err = training.run(&ctx).await.unwrap_err();

    assert!(matches!(
        err,
        TrainError::Diverged {
            step: 5,
            last_checkpoint: Some(0),
            ..
        }
    ));
    assert_eq!(training.state(), LoopState::Diverged);
    assert_eq!(training.global_step(), 5);

    assert_eq!(checkpoint_steps(dir.path()), vec![0]);
    assert!(!dir.path().join(CheckpointManager::snapshot_name(5)).exists());
    assert_eq!(CheckpointManager::new(dir.path()).index().unwrap().step, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_data_exhaustion_writes_final_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 100, 16, 1);
    config.wraparound = false;

    let ctx = ExecutionContext::new(1).unwrap();
    let mut training = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64)).unwrap();

    let report = training.run(&ctx).await.unwrap();

    assert_eq!(report.status, TerminalStatus::DataExhausted);
    assert_eq!(report.steps_run, 4);
    assert_eq!(report.global_step, 4);
    assert_eq!(report.last_checkpoint, Some(3));
    assert_eq!(training.state(), LoopState::Stopping);
    assert_eq!(checkpoint_steps(dir.path()), vec![0, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_before_first_step() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::new(1).unwrap();
    let mut training =
        TrainingLoop::new(config(dir.path(), 100, 16, 1), hooks(Arc::new(classifier()), 64))
            .unwrap();

    ctx.request_stop();
    let report = training.run(&ctx).await.unwrap();

    assert_eq!(report.status, TerminalStatus::Stopped);
    assert_eq!(report.steps_run, 0);
    assert_eq!(report.global_step, 0);
    assert_eq!(report.last_checkpoint, None);
    assert!(
        CheckpointManager::restore(dir.path(), None)
            .unwrap()
            .is_none()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restore_resumes_at_restored_step() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::new(1).unwrap();

    let mut first = TrainingLoop::new(
        config(first_dir.path(), 20, 16, 1),
        hooks(Arc::new(classifier()), 64),
    )
    .unwrap();
    first.run(&ctx).await.unwrap();

    let mut config = config(second_dir.path(), 30, 16, 1);
    config.restore_path = Some(first_dir.path().to_path_buf());
    let mut second = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64)).unwrap();

    assert_eq!(second.global_step(), 20);
    assert_eq!(second.last_checkpoint(), Some(19));
    assert_eq!(
        second.store().pull_params().unwrap(),
        first.store().pull_params().unwrap()
    );
    assert_eq!(
        second.moving_average().shadows(),
        first.moving_average().shadows()
    );

    let report = second.run(&ctx).await.unwrap();
    assert_eq!(report.steps_run, 10);
    assert_eq!(report.global_step, 30);
    assert_eq!(report.last_checkpoint, Some(29));
    assert_eq!(checkpoint_steps(second_dir.path()), vec![20, 29]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resumed_run_keeps_the_cadence() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::new(1).unwrap();

    let mut first = TrainingLoop::new(
        config(first_dir.path(), 23, 16, 1),
        hooks(Arc::new(classifier()), 64),
    )
    .unwrap();
    first.run(&ctx).await.unwrap();

    let mut config = config(second_dir.path(), 45, 16, 1);
    config.checkpoint_every = NonZeroU64::new(10).unwrap();
    config.restore_path = Some(first_dir.path().to_path_buf());
    let mut second = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64)).unwrap();

    let report = second.run(&ctx).await.unwrap();
    assert_eq!(report.steps_run, 22);
    assert_eq!(checkpoint_steps(second_dir.path()), vec![23, 30, 40, 44]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_checkpoint_keeps_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 12, 16, 1);
    config.checkpoint_every = NonZeroU64::new(5).unwrap();

    // Plain files where the snapshots of steps 5 and 11 would be staged.
    for step in [5, 11] {
        let staging = format!("{}.tmp", CheckpointManager::snapshot_name(step));
        fs::write(dir.path().join(staging), b"in the way").unwrap();
    }

    let ctx = ExecutionContext::new(1).unwrap();
    let mut training = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64)).unwrap();

    let report = training.run(&ctx).await.unwrap();
    assert_eq!(report.status, TerminalStatus::Completed);
    assert_eq!(report.global_step, 12);
    assert_eq!(report.last_checkpoint, Some(10));
    assert_eq!(training.last_checkpoint(), Some(10));
    assert_eq!(training.state(), LoopState::Completed);

    assert_eq!(checkpoint_steps(dir.path()), vec![0, 10]);
    let index = CheckpointManager::new(dir.path()).index().unwrap();
    assert_eq!(index.step, 10);
    assert_eq!(index.global_step, 11);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_trains_with_squared_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 40, 16, 2);
    config.loss = LossConfig::Mse;

    let hooks = hooks_with_loss(Arc::new(classifier()), 128, config.loss.build());
    let ctx = ExecutionContext::new(2).unwrap();
    let mut training = TrainingLoop::new(config, hooks).unwrap();

    let report = training.run(&ctx).await.unwrap();
    assert_eq!(report.status, TerminalStatus::Completed);
    assert!(report.last_loss.unwrap().is_finite());
    assert_eq!(checkpoint_steps(dir.path()), vec![0, 39]);

    let metrics = training.evaluate(16, None).unwrap();
    assert_eq!(metrics.global_step, 40);
    assert!(metrics.loss.is_finite());
}

#[test]
fn test_missing_restore_path_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 10, 16, 1);
    config.restore_path = Some(dir.path().join("nowhere"));

    let res = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64));
    assert!(matches!(res, Err(TrainError::Config(_))));

    let empty = tempfile::tempdir().unwrap();
    let mut config = self::config(dir.path(), 10, 16, 1);
    config.restore_path = Some(empty.path().to_path_buf());

    let res = TrainingLoop::new(config, hooks(Arc::new(classifier()), 64));
    assert!(matches!(res, Err(TrainError::Config(_))));
}

#[test]
fn test_indivisible_batch_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let res = TrainingLoop::new(config(dir.path(), 10, 10, 3), hooks(Arc::new(classifier()), 64));

    assert!(matches!(res, Err(TrainError::Config(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_devices() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 30, 16, 2);
    config.summary_every = NonZeroU64::new(5).unwrap();

    let ctx = ExecutionContext::new(2).unwrap();
    let mut training = TrainingLoop::new(config, hooks(Arc::new(classifier()), 128)).unwrap();

    let report = training.run(&ctx).await.unwrap();
    assert_eq!(report.status, TerminalStatus::Completed);
    assert_eq!(report.global_step, 30);
    assert_eq!(checkpoint_steps(dir.path()), vec![0, 29]);

    let summaries = read_summaries(dir.path());
    assert_eq!(summaries.len(), 6);
    let last = summaries.last().unwrap();
    let towers = last.scalars["tower_0/loss"] + last.scalars["tower_1/loss"];
    assert!((towers - last.scalars["loss"]).abs() < 1e-5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_context_must_match_devices() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ExecutionContext::new(1).unwrap();
    let mut training =
        TrainingLoop::new(config(dir.path(), 10, 16, 2), hooks(Arc::new(classifier()), 64))
            .unwrap();

    assert!(matches!(training.run(&ctx).await, Err(TrainError::Config(_))));
    assert_eq!(training.state(), LoopState::Failed);
    assert!(matches!(training.run(&ctx).await, Err(TrainError::Config(_))));
}
