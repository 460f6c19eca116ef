use std::sync::Arc;

use machine_learning::{
    DataSource, InMemoryDataset, LossFn, Network, SoftmaxClassifier, SoftmaxCrossEntropy,
};
use parameters::{GradientDescent, ParameterStore};
use tokio_util::sync::CancellationToken;
use towers::{DevicePool, DeviceSplitter, FeedPool, GradientReducer, TowerRunner};

const NUM_DEVICES: usize = 2;
const BATCH_SIZE: usize = 8;

#[tokio::test(flavor = "multi_thread")]
async fn test_feed_towers_reduce_and_apply() {
    let network: Arc<dyn Network> = Arc::new(SoftmaxClassifier::new(3, 2, 1));
    let loss_fn: Arc<dyn LossFn> = Arc::new(SoftmaxCrossEntropy);
    let dataset: Arc<dyn DataSource> = Arc::new(InMemoryDataset::synthetic(64, 3, 2, 1).unwrap());

    let store = ParameterStore::new(network.parameters(), |_| GradientDescent::new()).unwrap();
    let splitter = DeviceSplitter::new(BATCH_SIZE, NUM_DEVICES).unwrap();
    let pool = DevicePool::new(NUM_DEVICES).unwrap();
    let towers: Vec<_> = (0..NUM_DEVICES)
        .map(|device| Arc::new(TowerRunner::new(device, network.clone(), loss_fn.clone())))
        .collect();

    let streams = splitter.open_streams(dataset.as_ref(), true, 1).unwrap();
    let mut feed = FeedPool::spawn(streams, 2, true, CancellationToken::new());

    let full_batch = dataset.load_batch(64, false, 1).unwrap().next_batch().unwrap().unwrap();
    let full_loss = |store: &ParameterStore<GradientDescent>| {
        let params = store.pull_params().unwrap();
        towers[0].run(&params, &full_batch).unwrap().loss
    };
    let initial_loss = full_loss(&store);

    for step in 0..50u64 {
        let shards = feed.next_shards().await.unwrap();
        assert!(shards.iter().all(|shard| shard.len() == splitter.shard_size()));

        let params = Arc::new(store.pull_params().unwrap());
        let outputs = pool.run_towers(&towers, params, shards).await.unwrap();
        assert!(outputs.iter().all(|output| output.is_finite()));

        let gradients: Vec<_> = outputs.into_iter().map(|output| output.gradients).collect();
        let mean = GradientReducer.reduce(&gradients).unwrap();

        let global_step = store.apply_gradients(&mean, 0.05).unwrap();
        assert_eq!(global_step, step + 1);
    }

    feed.shutdown().await;

    assert!(full_loss(&store) < initial_loss);
}
