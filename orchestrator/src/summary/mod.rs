mod record;
mod reporter;

pub use record::{Histogram, SummaryRecord};
pub use reporter::{MetricsReporter, SUMMARY_FILE};
