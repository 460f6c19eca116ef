use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    mem,
    path::Path,
    sync::mpsc,
    thread::{self, JoinHandle},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, warn};
use parameters::{Optimizer, ParameterStore};

use super::{Histogram, SummaryRecord};

/// The file summaries are appended to, inside the training directory.
pub const SUMMARY_FILE: &str = "summaries.jsonl";

/// Accumulates scalars and histograms and hands them to a background writer.
///
/// Writing never blocks a training step: `flush` only queues the record, and write
/// failures are logged by the writer thread without reaching the training loop.
pub struct MetricsReporter {
    scalars: BTreeMap<String, f32>,
    histograms: BTreeMap<String, Histogram>,
    buckets: usize,
    tx: Option<mpsc::Sender<SummaryRecord>>,
    writer: Option<JoinHandle<usize>>,
}

impl MetricsReporter {
    /// Creates a new `MetricsReporter` writing to `<train_dir>/summaries.jsonl`.
    ///
    /// # Arguments
    /// * `train_dir` - The training directory.
    /// * `buckets` - The amount of buckets of every histogram.
    pub fn new(train_dir: &Path, buckets: usize) -> io::Result<Self> {
        let path = train_dir.join(SUMMARY_FILE);
        let (tx, rx) = mpsc::channel();

        let writer = thread::Builder::new()
            .name("summary-writer".into())
            .spawn(move || write_records(&path, rx))?;

        Ok(Self {
            scalars: BTreeMap::new(),
            histograms: BTreeMap::new(),
            buckets,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn scalar(&mut self, name: impl Into<String>, value: f32) {
        self.scalars.insert(name.into(), value);
    }

    pub fn histogram(&mut self, name: impl Into<String>, values: &[f32]) {
        let histogram = Histogram::from_values(values, self.buckets);
        self.histograms.insert(name.into(), histogram);
    }

    /// Records a histogram of every trainable parameter.
    pub fn parameter_histograms<O: Optimizer>(&mut self, store: &ParameterStore<O>) {
        let buckets = self.buckets;
        let histograms = &mut self.histograms;

        let res = store.try_visit(|name, _, weights| {
            histograms.insert(name.to_string(), Histogram::from_values(weights, buckets));
            Ok(())
        });

        if let Err(e) = res {
            warn!("failed to read the parameters for their histograms: {e}");
        }
    }

    /// Queues everything accumulated so far as the record of `step`.
    pub fn flush(&mut self, step: u64) {
        let record = SummaryRecord {
            step,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default(),
            scalars: mem::take(&mut self.scalars),
            histograms: mem::take(&mut self.histograms),
        };

        let Some(tx) = &self.tx else {
            return;
        };

        if tx.send(record).is_err() {
            warn!(step = step; "the summary writer is gone, dropping the summary");
        }
    }

    /// Waits for every queued record to be written.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.tx.take());

        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(written) => debug!(written = written; "summary writer finished"),
                Err(_) => warn!("the summary writer panicked"),
            }
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Appends every received record as one JSON line.
///
/// # Returns
/// The amount of records that were written.
fn write_records(path: &Path, rx: mpsc::Receiver<SummaryRecord>) -> usize {
    let mut file: Option<BufWriter<File>> = None;
    let mut written = 0;

    for record in rx {
        if file.is_none() {
            match open(path) {
                Ok(f) => file = Some(BufWriter::new(f)),
                Err(e) => {
                    warn!(step = record.step; "failed to open {}: {e}", path.display());
                    continue;
                }
            }
        }

        let Some(out) = file.as_mut() else {
            continue;
        };

        let res = serde_json::to_writer(&mut *out, &record)
            .map_err(io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());

        match res {
            Ok(()) => written += 1,
            Err(e) => warn!(step = record.step; "failed to write summary: {e}"),
        }
    }

    written
}

fn open(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    OpenOptions::new().create(true).append(true).open(path)
}
