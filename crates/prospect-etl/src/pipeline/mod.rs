//! Batch execution: worker pool, checkpointing driver and output sinks.

pub mod driver;
pub mod pool;
pub mod progress;
pub mod sink;

pub use driver::{run_enrichment, BatchDriver, RunOptions, RunSummary};
pub use pool::{PoolRun, WorkerPool};
pub use progress::{ProgressEvent, ProgressTracker, RunState};
pub use sink::{CsvSink, EnrichedRow, MemorySink, OutputSink};
