//! Bounded concurrent enrichment engine for prospect.
//!
//! Rows of a company table are enriched through rate-limited, cached
//! external collaborators, a bounded number at a time, and flushed to
//! the output in contiguous checkpointed batches so an interrupted run
//! can resume where it stopped.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod table;

pub use config::Config;
pub use enrich::{CachedSources, KeyedCache, RowEnricher, RowOutcome, Sources};
pub use error::{EnrichError, EnrichResult};
pub use fetch::{cached_sources, HttpSources};
pub use pipeline::{run_enrichment, BatchDriver, CsvSink, OutputSink, RunOptions, RunSummary};
pub use table::InputTable;
