//! Run state, progress events and throughput reporting.

use std::fmt;

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::enrich::enricher::SourceFailure;

/// Lifecycle of a batch run.
///
/// `Idle -> Running -> {Flushing <-> Running} -> Completed`, or
/// `Interrupted` when the operator cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Flushing,
    Completed,
    Interrupted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Flushing => "flushing",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// Observable progress of a run, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A row finished with every source answering.
    RowCompleted { offset: usize },
    /// A row finished with at least one source failure.
    RowDegraded {
        offset: usize,
        failures: Vec<SourceFailure>,
    },
    /// A batch was flushed; `checkpoint` rows are now durable.
    Checkpointed { checkpoint: usize },
    StateChanged { state: RunState },
}

/// Counts rows as they finish and logs rate and ETA every `report_every` rows.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    report_every: usize,
    processed: usize,
    completed: usize,
    degraded: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(total: usize, report_every: usize) -> Self {
        Self {
            total,
            report_every: report_every.max(1),
            processed: 0,
            completed: 0,
            degraded: 0,
            started: Instant::now(),
        }
    }

    pub fn record(&mut self, degraded: bool) {
        self.processed += 1;
        if degraded {
            self.degraded += 1;
        } else {
            self.completed += 1;
        }
        if self.processed % self.report_every == 0 {
            self.report();
        }
    }

    pub const fn processed(&self) -> usize {
        self.processed
    }

    pub const fn completed(&self) -> usize {
        self.completed
    }

    pub const fn degraded(&self) -> usize {
        self.degraded
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Rows per second since the tracker was created.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }

    /// Estimated time to finish the remaining rows at the current rate.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total.saturating_sub(self.processed) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn report(&self) {
        let pct = if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        };
        log::info!(
            "Progress: {}/{} ({:.1}%), completed {}, degraded {}, {:.1} rows/s, ETA {}s",
            self.processed,
            self.total,
            pct,
            self.completed,
            self.degraded,
            self.rate(),
            self.eta().map_or(0, |eta| eta.as_secs())
        );
    }

    pub fn final_report(&self) {
        log::info!(
            "Processed {} rows in {:.1}s ({:.1} rows/s): completed {}, degraded {}",
            self.processed,
            self.elapsed().as_secs_f64(),
            self.rate(),
            self.completed,
            self.degraded
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tracker_counts_and_eta() {
        let mut tracker = ProgressTracker::new(10, 100);
        for i in 0..4 {
            tracker.record(i == 3);
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(tracker.processed(), 4);
        assert_eq!(tracker.completed(), 3);
        assert_eq!(tracker.degraded(), 1);
        assert!((tracker.rate() - 2.0).abs() < 1e-6);
        assert_eq!(tracker.eta().map(|d| d.as_secs()), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eta_before_time_passes() {
        let tracker = ProgressTracker::new(10, 0);
        assert_eq!(tracker.eta(), None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RunState::Interrupted.to_string(), "interrupted");
        assert_eq!(RunState::Flushing.to_string(), "flushing");
    }
}
