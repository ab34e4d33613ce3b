//! Checkpointing batch driver.
//!
//! Rows stream through one worker pool. Finished rows are held until the
//! next checkpoint-interval batch is whole, then that batch is flushed to
//! the sink in offset order, so the sink's row count is always a valid
//! resume offset. At most one interval plus the pool's concurrency of rows
//! run ahead of the checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use prospect_core::model::InputRow;

use crate::enrich::enricher::{RowEnricher, RowOutcome};
use crate::error::{EnrichError, EnrichResult};
use crate::pipeline::pool::WorkerPool;
use crate::pipeline::progress::{ProgressEvent, ProgressTracker, RunState};
use crate::pipeline::sink::{EnrichedRow, OutputSink};

const EVENT_CAPACITY: usize = 1024;

/// Explicit settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Rows enriched concurrently.
    pub concurrency: usize,
    /// Rows per durable flush.
    pub checkpoint_interval: usize,
    /// Continue after the rows already in the sink instead of starting over.
    pub resume: bool,
    /// Deadline for each row's collaborator calls; a call still pending
    /// then leaves only its own fields empty.
    pub row_timeout: Option<Duration>,
    /// How long rows in flight may finish after cancellation.
    pub drain_grace: Duration,
    /// Log progress every this many rows.
    pub report_every: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            checkpoint_interval: 500,
            resume: false,
            row_timeout: Some(Duration::from_secs(120)),
            drain_grace: Duration::from_secs(30),
            report_every: 50,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> EnrichResult<()> {
        if self.concurrency == 0 {
            return Err(EnrichError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(EnrichError::InvalidInput(
                "checkpoint interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_rows: usize,
    /// Checkpoint the run started from.
    pub resumed_from: usize,
    /// Rows enriched by this run, including any discarded on cancellation.
    pub processed: usize,
    pub completed: usize,
    pub degraded: usize,
    /// Rows durably held by the sink when the run ended.
    pub checkpoint: usize,
    pub state: RunState,
}

/// Feeds rows through the pool and flushes results at a fixed cadence.
#[derive(Debug)]
pub struct BatchDriver {
    enricher: Arc<RowEnricher>,
    options: RunOptions,
    state: RunState,
    events: broadcast::Sender<ProgressEvent>,
}

impl BatchDriver {
    pub fn new(enricher: RowEnricher, options: RunOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            enricher: Arc::new(enricher),
            options,
            state: RunState::Idle,
            events,
        }
    }

    pub const fn state(&self) -> RunState {
        self.state
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Receive progress events from now on. Slow receivers miss events
    /// rather than slowing the run.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProgressEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn transition(&mut self, state: RunState) {
        if self.state != state {
            log::debug!("Run state {} -> {}", self.state, state);
            self.state = state;
            self.emit(ProgressEvent::StateChanged { state });
        }
    }

    /// Enrich `rows` into `sink`.
    ///
    /// With `resume` set, rows below the sink's current row count are
    /// skipped entirely; otherwise the sink is reset first. Returns an
    /// error only for unusable options or input, or when a flush cannot be
    /// made durable. Cancellation ends the run as [`RunState::Interrupted`]
    /// after flushing the last complete batch.
    pub async fn run<S>(
        &mut self,
        rows: &[InputRow],
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> EnrichResult<RunSummary>
    where
        S: OutputSink + ?Sized,
    {
        self.options.validate()?;

        let start = if self.options.resume {
            sink.row_count()?
        } else {
            sink.reset()?;
            0
        };
        if start > rows.len() {
            return Err(EnrichError::InvalidInput(format!(
                "output already holds {start} rows but the input has only {}",
                rows.len()
            )));
        }
        if start > 0 {
            log::info!("Resuming from row {} of {}", start, rows.len());
        }

        self.transition(RunState::Running);
        let pool = WorkerPool::new(self.options.concurrency, self.options.drain_grace);
        let lookahead = self.options.checkpoint_interval + pool.concurrency();
        let mut tracker = ProgressTracker::new(rows.len() - start, self.options.report_every);
        let mut ready = BTreeMap::new();
        let mut checkpoint = start;

        let timeout = self.options.row_timeout;
        let enricher = Arc::clone(&self.enricher);
        let mut run = pool.start(&rows[start..], move |row: InputRow| {
            let enricher = Arc::clone(&enricher);
            async move { enricher.enrich_within(&row, timeout).await }
        });

        loop {
            run.admit(checkpoint - start + lookahead);
            let Some(settled) = run.next(cancel).await else {
                break;
            };
            self.record(rows, start + settled.position, settled.output, &mut tracker, &mut ready);
            checkpoint = self.flush_ready(rows, checkpoint, &mut ready, sink)?;
        }

        if cancel.is_cancelled() {
            log::info!(
                "Stopping with {} rows in flight and {} not started",
                run.in_flight(),
                run.remaining()
            );
            for settled in run.drain().await {
                self.record(rows, start + settled.position, settled.output, &mut tracker, &mut ready);
            }
            checkpoint = self.flush_ready(rows, checkpoint, &mut ready, sink)?;
            if !ready.is_empty() {
                log::info!(
                    "Discarding {} finished rows of an unfinished batch; checkpoint stays at {}",
                    ready.len(),
                    checkpoint
                );
            }
        }

        tracker.final_report();
        let state = if checkpoint == rows.len() {
            RunState::Completed
        } else {
            RunState::Interrupted
        };
        self.transition(state);

        Ok(RunSummary {
            total_rows: rows.len(),
            resumed_from: start,
            processed: tracker.processed(),
            completed: tracker.completed(),
            degraded: tracker.degraded(),
            checkpoint,
            state,
        })
    }

    /// Count a settled row, report it, and hold it until its batch is whole.
    fn record(
        &self,
        rows: &[InputRow],
        index: usize,
        output: Result<RowOutcome, String>,
        tracker: &mut ProgressTracker,
        ready: &mut BTreeMap<usize, RowOutcome>,
    ) {
        let offset = rows[index].offset();
        let outcome = output.unwrap_or_else(|message| {
            RowOutcome::degraded(offset, self.enricher.schema(), format!("panicked: {message}"))
        });
        tracker.record(outcome.is_degraded());
        let event = if outcome.is_degraded() {
            ProgressEvent::RowDegraded {
                offset,
                failures: outcome.failures.clone(),
            }
        } else {
            ProgressEvent::RowCompleted { offset }
        };
        self.emit(event);
        ready.insert(index, outcome);
    }

    /// Flush every whole batch at the front of `ready`, in order. Returns
    /// the new checkpoint.
    fn flush_ready<S>(
        &mut self,
        rows: &[InputRow],
        mut checkpoint: usize,
        ready: &mut BTreeMap<usize, RowOutcome>,
        sink: &mut S,
    ) -> EnrichResult<usize>
    where
        S: OutputSink + ?Sized,
    {
        loop {
            let end = (checkpoint + self.options.checkpoint_interval).min(rows.len());
            if end == checkpoint || ready.range(checkpoint..end).count() < end - checkpoint {
                return Ok(checkpoint);
            }

            self.transition(RunState::Flushing);
            let records: Vec<EnrichedRow> = (checkpoint..end)
                .filter_map(|index| {
                    ready.remove(&index).map(|outcome| EnrichedRow {
                        input: rows[index].clone(),
                        result: outcome.result,
                    })
                })
                .collect();
            debug_assert_eq!(records.len(), end - checkpoint);
            if let Err(e) = sink.append_batch(&records) {
                log::error!("Flush at row {} failed: {}", checkpoint, e);
                self.transition(RunState::Interrupted);
                return Err(match e {
                    EnrichError::Durability { .. } => e,
                    other => EnrichError::durability(other),
                });
            }
            checkpoint = end;
            log::info!("Checkpoint: {}/{} rows written", checkpoint, rows.len());
            self.emit(ProgressEvent::Checkpointed { checkpoint });
            self.transition(RunState::Running);
        }
    }
}

/// Run a whole enrichment: build a [`BatchDriver`] and drive `rows` into `sink`.
pub async fn run_enrichment<S>(
    rows: &[InputRow],
    enricher: RowEnricher,
    options: RunOptions,
    sink: &mut S,
    cancel: &CancellationToken,
) -> EnrichResult<RunSummary>
where
    S: OutputSink + ?Sized,
{
    BatchDriver::new(enricher, options).run(rows, sink, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::resilience::{AdaptiveRateLimiter, AdaptiveSettings};
    use crate::enrich::sources::{self, Sources};
    use crate::pipeline::sink::MemorySink;
    use async_trait::async_trait;
    use prospect_core::model::{
        Address, Coordinates, EntityColumns, Filing, Headcount, OutputSchema, Profile,
    };
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Answers every call immediately; the site found encodes the name.
    #[derive(Debug, Default)]
    struct EchoSources {
        panic_on: Option<String>,
        slow_on: Option<String>,
        searches_started: Mutex<Vec<(String, Instant)>>,
    }

    #[async_trait]
    impl Sources for EchoSources {
        async fn fetch_profile(&self, _: &str) -> EnrichResult<Option<Profile>> {
            Ok(None)
        }
        async fn fetch_filing_history(&self, _: &str) -> EnrichResult<Vec<Filing>> {
            Ok(Vec::new())
        }
        async fn extract_headcount(&self, _: &[Filing], _: &[String]) -> EnrichResult<Headcount> {
            Ok(Headcount::new())
        }
        async fn find_official_site(
            &self,
            name: &str,
            _: &AdaptiveRateLimiter,
        ) -> EnrichResult<Option<String>> {
            self.searches_started
                .lock()
                .unwrap()
                .push((name.to_string(), Instant::now()));
            if self.panic_on.as_deref() == Some(name) {
                panic!("malformed row {name}");
            }
            if self.slow_on.as_deref() == Some(name) {
                tokio::time::sleep(Duration::from_secs(100)).await;
            }
            if name.ends_with('3') {
                return Err(EnrichError::http(sources::SEARCH, "503"));
            }
            Ok(Some(format!("https://{name}.example")))
        }
        async fn scrape_description(&self, _: &str) -> EnrichResult<String> {
            Ok(String::new())
        }
        async fn geocode(&self, _: &str) -> EnrichResult<Option<Coordinates>> {
            Ok(None)
        }
    }

    /// Accepts a fixed number of flushes, then fails every later one.
    #[derive(Debug, Default)]
    struct FlakySink {
        inner: MemorySink,
        accept: usize,
    }

    impl OutputSink for FlakySink {
        fn row_count(&self) -> EnrichResult<usize> {
            self.inner.row_count()
        }
        fn reset(&mut self) -> EnrichResult<()> {
            self.inner.reset()
        }
        fn append_batch(&mut self, rows: &[EnrichedRow]) -> EnrichResult<()> {
            if self.inner.flushes() >= self.accept {
                return Err(EnrichError::durability("disk full"));
            }
            self.inner.append_batch(rows)
        }
    }

    /// Every lookup succeeds at once except search, which waits on the
    /// limiter.
    #[derive(Debug, Default)]
    struct ThrottledSources;

    #[async_trait]
    impl Sources for ThrottledSources {
        async fn fetch_profile(&self, _: &str) -> EnrichResult<Option<Profile>> {
            Ok(Some(Profile {
                registered_office_address: Some(Address {
                    address_line_1: Some("1 Mill Lane".to_string()),
                    locality: Some("Bradford".to_string()),
                    ..Address::default()
                }),
                ..Profile::default()
            }))
        }
        async fn fetch_filing_history(&self, _: &str) -> EnrichResult<Vec<Filing>> {
            Ok(vec![Filing::default()])
        }
        async fn extract_headcount(&self, _: &[Filing], _: &[String]) -> EnrichResult<Headcount> {
            Ok(Headcount::from([("2023".to_string(), Some(12))]))
        }
        async fn find_official_site(
            &self,
            name: &str,
            limiter: &AdaptiveRateLimiter,
        ) -> EnrichResult<Option<String>> {
            limiter.acquire().await;
            Ok(Some(format!("https://{name}.example")))
        }
        async fn scrape_description(&self, _: &str) -> EnrichResult<String> {
            Ok(String::new())
        }
        async fn geocode(&self, _: &str) -> EnrichResult<Option<Coordinates>> {
            Ok(Some(Coordinates {
                lat: 53.79,
                lng: -1.75,
                label: None,
            }))
        }
    }

    fn shared(sources: Arc<dyn Sources>, search_limiter: AdaptiveRateLimiter) -> RowEnricher {
        RowEnricher::new(
            sources,
            search_limiter,
            EntityColumns::default(),
            OutputSchema::default(),
        )
    }

    fn enricher(sources: EchoSources) -> RowEnricher {
        shared(
            Arc::new(sources),
            AdaptiveRateLimiter::new(1000.0, None, AdaptiveSettings::default()),
        )
    }

    fn rows(n: usize) -> Vec<InputRow> {
        let columns: Arc<[String]> =
            vec!["CompanyNumber".to_string(), "CompanyName".to_string()].into();
        (0..n)
            .map(|i| {
                InputRow::new(i, columns.clone(), vec![format!("{i:08}"), format!("c{i}")])
                    .unwrap()
            })
            .collect()
    }

    fn options(concurrency: usize, interval: usize) -> RunOptions {
        RunOptions {
            concurrency,
            checkpoint_interval: interval,
            ..RunOptions::default()
        }
    }

    #[tokio::test]
    async fn test_full_run_flushes_every_interval() {
        let input = rows(25);
        let mut sink = MemorySink::new();
        let summary = run_enrichment(
            &input,
            enricher(EchoSources::default()),
            options(4, 10),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.checkpoint, 25);
        assert_eq!(summary.processed, 25);
        assert_eq!(summary.degraded, 3);
        assert_eq!(sink.flushes(), 3);
        for (i, row) in sink.rows().iter().enumerate() {
            assert_eq!(row.input.offset(), i);
            if i % 10 != 3 {
                assert_eq!(row.result.company_url, format!("https://c{i}.example"));
            }
        }
    }

    #[tokio::test]
    async fn test_events_report_rows_checkpoints_and_states() {
        let input = rows(4);
        let mut sink = MemorySink::new();
        let mut driver = BatchDriver::new(enricher(EchoSources::default()), options(2, 2));
        let mut events = driver.subscribe();

        driver
            .run(&input, &mut sink, &CancellationToken::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let checkpoints: Vec<usize> = seen
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::Checkpointed { checkpoint } => Some(*checkpoint),
                _ => None,
            })
            .collect();
        assert_eq!(checkpoints, vec![2, 4]);
        assert!(seen.contains(&ProgressEvent::StateChanged {
            state: RunState::Completed
        }));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ProgressEvent::RowDegraded { offset: 3, .. })));
        assert_eq!(driver.state(), RunState::Completed);
    }

    #[tokio::test]
    async fn test_flush_fault_keeps_checkpoint() {
        let input = rows(30);
        let mut sink = FlakySink {
            accept: 2,
            ..FlakySink::default()
        };
        let err = run_enrichment(
            &input,
            enricher(EchoSources::default()),
            options(3, 10),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, EnrichError::Durability { .. }));
        assert_eq!(sink.row_count().unwrap(), 20);
    }

    #[tokio::test]
    async fn test_panicking_row_is_emitted_degraded() {
        let input = rows(5);
        let mut sink = MemorySink::new();
        let summary = run_enrichment(
            &input,
            enricher(EchoSources {
                panic_on: Some("c1".to_string()),
                ..EchoSources::default()
            }),
            options(2, 5),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.checkpoint, 5);
        assert_eq!(summary.degraded, 2);
        assert_eq!(sink.rows()[1].result.filled_fields(), 0);
        assert_eq!(sink.rows()[2].result.company_url, "https://c2.example");
    }

    #[tokio::test]
    async fn test_cancelled_run_keeps_whole_batches_only() {
        let input = rows(10);
        let mut sink = MemorySink::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_enrichment(
            &input,
            enricher(EchoSources::default()),
            options(2, 5),
            &mut sink,
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(summary.state, RunState::Interrupted);
        assert_eq!(summary.checkpoint, 0);
        assert_eq!(sink.row_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resume_beyond_input_is_rejected() {
        let mut sink = MemorySink::new();
        let input = rows(3);
        run_enrichment(
            &input,
            enricher(EchoSources::default()),
            options(2, 3),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = run_enrichment(
            &input[..2],
            enricher(EchoSources::default()),
            RunOptions {
                resume: true,
                ..options(2, 3)
            },
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnrichError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let err = run_enrichment(
            &rows(1),
            enricher(EchoSources::default()),
            options(1, 0),
            &mut MemorySink::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnrichError::InvalidInput(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_row_leaves_other_slots_working() {
        let sources = Arc::new(EchoSources {
            slow_on: Some("c0".to_string()),
            ..EchoSources::default()
        });
        let input = rows(8);
        let mut sink = MemorySink::new();
        let begun = Instant::now();

        let summary = run_enrichment(
            &input,
            shared(
                sources.clone(),
                AdaptiveRateLimiter::new(1000.0, None, AdaptiveSettings::default()),
            ),
            options(4, 4),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let started = sources.searches_started.lock().unwrap().clone();
        let (_, c4_started) = started.iter().find(|(name, _)| name == "c4").unwrap();
        assert!(c4_started.duration_since(begun) < Duration::from_secs(1));

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(sink.flushes(), 2);
        let offsets: Vec<usize> = sink.rows().iter().map(|r| r.input.offset()).collect();
        assert_eq!(offsets, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_search_keeps_other_fields() {
        let settings = AdaptiveSettings {
            floor: 0.05,
            ..AdaptiveSettings::default()
        };
        let limiter = AdaptiveRateLimiter::new(0.05, None, settings);
        let input = rows(20);
        let mut sink = MemorySink::new();

        let summary = run_enrichment(
            &input,
            shared(Arc::new(ThrottledSources), limiter),
            options(10, 20),
            &mut sink,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(summary.checkpoint, 20);
        assert!(summary.degraded > 0);
        for row in sink.rows() {
            assert_eq!(row.result.manufacturing_location, "53.79,-1.75");
            assert_eq!(row.result.headcount("2023"), Some("12"));
        }
        assert!(sink.rows().iter().any(|r| !r.result.company_url.is_empty()));
    }
}
