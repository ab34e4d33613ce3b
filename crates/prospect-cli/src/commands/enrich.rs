use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use prospect_etl::pipeline::{ProgressEvent, RunState};
use prospect_etl::{
    BatchDriver, Config, CsvSink, HttpSources, InputTable, KeyedCache, RowEnricher, Sources,
};

/// Command-line overrides for one enrichment run.
#[derive(Debug)]
pub struct EnrichArgs {
    pub input: PathBuf,
    pub out: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub checkpoint: Option<usize>,
    pub resume: bool,
    pub no_cache: bool,
}

/// `companies.csv` -> `companies_enriched.csv`, next to the input.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    input.with_file_name(format!("{stem}_enriched.csv"))
}

pub async fn run_enrich(mut config: Config, args: EnrichArgs) -> Result<()> {
    if let Some(concurrency) = args.concurrency {
        config.max_concurrency = concurrency;
    }
    if let Some(checkpoint) = args.checkpoint {
        config.checkpoint_interval = checkpoint;
    }

    let table = InputTable::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let columns = config.entity_columns();
    table.require(&columns)?;

    let schema = config.output_schema();
    let out = args
        .out
        .unwrap_or_else(|| default_output_path(&args.input));
    let header: Vec<String> = table
        .columns()
        .iter()
        .cloned()
        .chain(schema.columns())
        .collect();
    let mut sink = CsvSink::open(&out, header)
        .with_context(|| format!("Failed to open output {}", out.display()))?;

    if !args.resume && out.exists() {
        log::warn!("Overwriting existing output {}", out.display());
    }

    let (sources, cache): (Arc<dyn Sources>, Option<KeyedCache>) = if args.no_cache {
        (Arc::new(HttpSources::from_config(&config)?), None)
    } else {
        let cached = prospect_etl::cached_sources(&config)?;
        let cache = cached.cache().clone();
        (Arc::new(cached), Some(cache))
    };

    let enricher = RowEnricher::new(sources, config.search.build(), columns, schema);
    let mut driver = BatchDriver::new(enricher, config.engine_options(args.resume));

    println!(
        "Enriching {} rows from {} into {}",
        table.len(),
        args.input.display(),
        out.display()
    );
    println!(
        "  concurrency {}, checkpoint every {} rows{}",
        config.max_concurrency,
        config.checkpoint_interval,
        if args.resume { ", resuming" } else { "" }
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Interrupted: finishing rows in flight, then saving the last checkpoint...");
            on_interrupt.cancel();
        }
    });

    let mut events = driver.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let ProgressEvent::Checkpointed { checkpoint } = event {
                println!("  ✓ Checkpoint: {checkpoint} rows written");
            }
        }
    });

    let summary = driver.run(table.rows(), &mut sink, &cancel).await?;

    println!();
    match summary.state {
        RunState::Completed => println!("✓ Enrichment complete"),
        _ => println!("⏸ Enrichment interrupted; rerun with --resume to continue"),
    }
    println!("  Rows in output: {}/{}", summary.checkpoint, summary.total_rows);
    if summary.resumed_from > 0 {
        println!("  Resumed from row: {}", summary.resumed_from);
    }
    println!(
        "  Processed this run: {} (complete {}, degraded {})",
        summary.processed, summary.completed, summary.degraded
    );
    if let Some(cache) = cache {
        let counters = cache.counters();
        println!(
            "  Cache: {} hits, {} misses{}",
            counters.hits,
            counters.misses,
            if counters.faults > 0 {
                format!(", {} faults", counters.faults)
            } else {
                String::new()
            }
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/data/companies.csv")),
            PathBuf::from("/data/companies_enriched.csv")
        );
        assert_eq!(
            default_output_path(Path::new("list")),
            PathBuf::from("list_enriched.csv")
        );
    }
}
