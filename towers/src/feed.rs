use log::{debug, error, warn};
use machine_learning::{Batch, BatchStream};
use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

/// Background workers that keep a bounded queue of batches ready for every device.
///
/// Each device stream is driven by its own blocking worker. Workers stop when their stream
/// is exhausted (and wraparound is off), when their queue is dropped, or when the pool's
/// token is cancelled.
pub struct FeedPool {
    queues: Vec<mpsc::Receiver<Batch>>,
    workers: JoinSet<usize>,
    token: CancellationToken,
}

impl FeedPool {
    /// Spawns one feed worker per stream. Must be called from within a tokio runtime.
    ///
    /// # Arguments
    /// * `streams` - One batch stream per device, in device order.
    /// * `capacity` - The amount of batches buffered per device.
    /// * `wraparound` - Whether exhausted streams restart instead of stopping.
    /// * `token` - Cancelling it stops every worker.
    pub fn spawn(
        streams: Vec<Box<dyn BatchStream>>,
        capacity: usize,
        wraparound: bool,
        token: CancellationToken,
    ) -> Self {
        let mut workers = JoinSet::new();
        let queues = streams
            .into_iter()
            .enumerate()
            .map(|(device, stream)| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                let token = token.clone();
                workers.spawn_blocking(move || feed(device, stream, tx, wraparound, token));
                rx
            })
            .collect();

        Self {
            queues,
            workers,
            token,
        }
    }

    /// Waits for the next shard of every device.
    ///
    /// # Returns
    /// One batch per device in device order, or `None` once any stream is exhausted or the
    /// pool was cancelled.
    pub async fn next_shards(&mut self) -> Option<Vec<Batch>> {
        let mut shards = Vec::with_capacity(self.queues.len());

        for queue in &mut self.queues {
            let shard = tokio::select! {
                biased;
                _ = self.token.cancelled() => None,
                shard = queue.recv() => shard,
            };

            shards.push(shard?);
        }

        Some(shards)
    }

    /// Stops every worker and waits for all of them to finish.
    pub async fn shutdown(mut self) {
        self.queues.clear();
        self.token.cancel();

        while let Some(res) = self.workers.join_next().await {
            match res {
                Ok(produced) => debug!(produced = produced; "feed worker joined"),
                Err(e) => error!("feed worker failed: {e}"),
            }
        }
    }
}

/// Pushes batches from `stream` into `tx` until told to stop.
///
/// # Returns
/// The amount of batches that were queued.
fn feed(
    device: usize,
    mut stream: Box<dyn BatchStream>,
    tx: mpsc::Sender<Batch>,
    wraparound: bool,
    token: CancellationToken,
) -> usize {
    let mut produced = 0;
    let mut produced_this_pass = false;

    while !token.is_cancelled() {
        match stream.next_batch() {
            Ok(Some(batch)) => {
                if tx.blocking_send(batch).is_err() {
                    break;
                }

                produced += 1;
                produced_this_pass = true;
            }
            Ok(None) if wraparound && produced_this_pass => {
                debug!(device = device; "restarting exhausted batch stream");
                stream.restart();
                produced_this_pass = false;
            }
            Ok(None) => {
                debug!(device = device, produced = produced; "batch stream exhausted");
                break;
            }
            Err(e) => {
                warn!(device = device; "batch stream failed, stopping its feed: {e}");
                break;
            }
        }
    }

    produced
}

#[cfg(test)]
mod tests {
    use machine_learning::{DataSource, InMemoryDataset};
    use ndarray::{Array1, Array2};

    use super::*;

    fn dataset(len: usize) -> InMemoryDataset {
        let inputs = Array2::from_shape_fn((len, 1), |(i, _)| i as f32);
        InMemoryDataset::new(inputs, Array1::zeros(len), 0).unwrap()
    }

    fn streams(dataset: &InMemoryDataset, n: usize, batch_size: usize) -> Vec<Box<dyn BatchStream>> {
        (0..n)
            .map(|_| dataset.load_batch(batch_size, false, 1).unwrap())
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exhaustion_without_wraparound() {
        let dataset = dataset(6);
        let mut feed = FeedPool::spawn(streams(&dataset, 2, 3), 1, false, CancellationToken::new());

        for _ in 0..2 {
            let shards = feed.next_shards().await.unwrap();
            assert_eq!(shards.len(), 2);
        }
        assert!(feed.next_shards().await.is_none());

        feed.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wraparound_restarts_streams() {
        let dataset = dataset(4);
        let mut feed = FeedPool::spawn(streams(&dataset, 1, 2), 2, true, CancellationToken::new());

        for _ in 0..7 {
            let shards = feed.next_shards().await.unwrap();
            assert_eq!(shards[0].len(), 2);
        }

        feed.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancellation_unblocks_waiters() {
        let dataset = dataset(4);
        let token = CancellationToken::new();
        let mut feed = FeedPool::spawn(streams(&dataset, 1, 2), 1, true, token.child_token());

        token.cancel();
        assert!(feed.next_shards().await.is_none());

        tokio::time::timeout(std::time::Duration::from_secs(5), feed.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_joins_blocked_workers() {
        let dataset = dataset(8);
        let feed = FeedPool::spawn(streams(&dataset, 3, 1), 1, true, CancellationToken::new());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), feed.shutdown())
            .await
            .unwrap();
    }
}
