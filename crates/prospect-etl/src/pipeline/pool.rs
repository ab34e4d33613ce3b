//! Bounded worker pool.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use prospect_core::model::InputRow;

/// One row that left the pool.
#[derive(Debug)]
pub struct Settled<T> {
    /// Position of the row in the slice given to [`WorkerPool::start`].
    pub position: usize,
    /// The row's output, or the message it panicked with.
    pub output: Result<T, String>,
}

/// Runs a per-row function with at most `concurrency` invocations in
/// flight.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    drain_grace: Duration,
}

impl WorkerPool {
    pub fn new(concurrency: usize, drain_grace: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            drain_grace,
        }
    }

    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Begin feeding `rows` through `work`. Nothing is spawned until the
    /// first [`PoolRun::next`]; every row is admitted unless narrowed with
    /// [`PoolRun::admit`].
    pub fn start<'r, T, W, Fut>(&self, rows: &'r [InputRow], work: W) -> PoolRun<'r, T, W>
    where
        T: Send + 'static,
        W: Fn(InputRow) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        PoolRun {
            concurrency: self.concurrency,
            drain_grace: self.drain_grace,
            rows,
            started: 0,
            admitted: rows.len(),
            tasks: JoinSet::new(),
            work,
        }
    }
}

/// Rows moving through a [`WorkerPool`].
///
/// Rows are spawned lazily in slice order as slots free up, so no queue of
/// pending work builds up beyond the cap. A slow row holds only its own
/// slot. Dropping the run aborts whatever is still in flight.
pub struct PoolRun<'r, T, W> {
    concurrency: usize,
    drain_grace: Duration,
    rows: &'r [InputRow],
    started: usize,
    admitted: usize,
    tasks: JoinSet<(usize, std::thread::Result<T>)>,
    work: W,
}

impl<T, W> fmt::Debug for PoolRun<'_, T, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRun")
            .field("concurrency", &self.concurrency)
            .field("rows", &self.rows.len())
            .field("started", &self.started)
            .field("admitted", &self.admitted)
            .field("in_flight", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl<T, W, Fut> PoolRun<'_, T, W>
where
    T: Send + 'static,
    W: Fn(InputRow) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    /// Allow only the first `count` rows to start. Rows already started are
    /// unaffected.
    pub fn admit(&mut self, count: usize) {
        self.admitted = count.min(self.rows.len());
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Rows not started yet.
    pub fn remaining(&self) -> usize {
        self.rows.len() - self.started
    }

    fn fill(&mut self) {
        while self.tasks.len() < self.concurrency && self.started < self.admitted {
            let position = self.started;
            self.started += 1;
            let job = AssertUnwindSafe((self.work)(self.rows[position].clone())).catch_unwind();
            self.tasks.spawn(async move { (position, job.await) });
        }
    }

    /// Wait for the next row to finish, starting admitted rows as slots
    /// free up.
    ///
    /// `None` once nothing admitted is left in flight, or as soon as
    /// `cancel` fires. No row is started after cancellation.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<Settled<T>> {
        loop {
            if !cancel.is_cancelled() {
                self.fill();
            }
            if self.tasks.is_empty() {
                return None;
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                Some(joined) = self.tasks.join_next() => {
                    if let Some(settled) = settle(joined) {
                        return Some(settled);
                    }
                }
            }
        }
    }

    /// Give the rows in flight `drain_grace` to finish, then abort the rest.
    pub async fn drain(&mut self) -> Vec<Settled<T>> {
        let mut settled = Vec::new();
        if self.tasks.is_empty() {
            return settled;
        }
        log::info!(
            "Cancellation requested, waiting up to {:?} for {} rows in flight",
            self.drain_grace,
            self.tasks.len()
        );
        let tasks = &mut self.tasks;
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                settled.extend(settle(joined));
            }
        };
        if tokio::time::timeout(self.drain_grace, drain).await.is_err() {
            log::warn!("Abandoning {} rows still in flight", self.tasks.len());
            self.tasks.shutdown().await;
        }
        settled
    }
}

fn settle<T>(joined: Result<(usize, std::thread::Result<T>), JoinError>) -> Option<Settled<T>> {
    match joined {
        Ok((position, Ok(output))) => Some(Settled {
            position,
            output: Ok(output),
        }),
        Ok((position, Err(payload))) => {
            let message = panic_message(&*payload);
            log::error!("Row at position {} panicked: {}", position, message);
            Some(Settled {
                position,
                output: Err(message),
            })
        }
        Err(e) => {
            log::debug!("Worker task ended without output: {}", e);
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn rows(n: usize) -> Vec<InputRow> {
        let columns: Arc<[String]> = vec!["CompanyNumber".to_string()].into();
        (0..n)
            .map(|i| InputRow::new(i, columns.clone(), vec![format!("{i:08}")]).unwrap())
            .collect()
    }

    #[derive(Debug, Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn collect<T, W, Fut>(
        run: &mut PoolRun<'_, T, W>,
        cancel: &CancellationToken,
    ) -> Vec<Settled<T>>
    where
        T: Send + 'static,
        W: Fn(InputRow) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut settled = Vec::new();
        while let Some(s) = run.next(cancel).await {
            settled.push(s);
        }
        settled
    }

    #[tokio::test]
    async fn test_at_most_c_rows_in_flight() {
        let pool = WorkerPool::new(3, Duration::from_secs(1));
        let gate = Arc::new(Semaphore::new(0));
        let gauge = Arc::new(Gauge::default());
        let input = rows(10);
        let cancel = CancellationToken::new();

        let mut run = pool.start(&input, |row: InputRow| {
            let gate = gate.clone();
            let gauge = gauge.clone();
            async move {
                gauge.enter();
                let permit = gate.acquire().await.unwrap();
                permit.forget();
                gauge.leave();
                row.values()[0].clone()
            }
        });

        let release = async {
            while gauge.current.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            assert_eq!(gauge.current.load(Ordering::SeqCst), 3);
            gate.add_permits(10);
        };

        let (settled, ()) = tokio::join!(collect(&mut run, &cancel), release);

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
        assert_eq!(settled.len(), 10);
        for s in &settled {
            assert_eq!(s.output.as_deref(), Ok(format!("{:08}", s.position).as_str()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion_keeps_attribution() {
        let pool = WorkerPool::new(4, Duration::from_secs(1));
        let input = rows(8);
        let mut run = pool.start(&input, |row: InputRow| async move {
            let delay = 80 - 10 * row.offset() as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            row.offset() * 10
        });

        let settled = collect(&mut run, &CancellationToken::new()).await;

        let order: Vec<usize> = settled.iter().map(|s| s.position).collect();
        assert_ne!(order, (0..8).collect::<Vec<_>>());
        assert_eq!(settled.len(), 8);
        for s in settled {
            assert_eq!(s.output, Ok(s.position * 10));
        }
    }

    #[tokio::test]
    async fn test_panicking_row_is_reported() {
        let pool = WorkerPool::new(2, Duration::from_secs(1));
        let input = rows(4);
        let mut run = pool.start(&input, |row: InputRow| async move {
            if row.offset() == 2 {
                panic!("bad row");
            }
            format!("ok {}", row.offset())
        });

        let mut settled = collect(&mut run, &CancellationToken::new()).await;
        settled.sort_by_key(|s| s.position);

        assert_eq!(settled.len(), 4);
        assert_eq!(settled[2].output, Err("bad row".to_string()));
        assert_eq!(settled[3].output, Ok("ok 3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_row_does_not_block_other_slots() {
        let pool = WorkerPool::new(2, Duration::from_secs(5));
        let input = rows(6);
        let cancel = CancellationToken::new();
        let mut run = pool.start(&input, |row: InputRow| async move {
            if row.offset() == 0 {
                std::future::pending::<()>().await;
            }
            row.offset()
        });

        let mut finished = Vec::new();
        while finished.len() < 5 {
            let Some(s) = run.next(&cancel).await else {
                break;
            };
            finished.push(s.position);
        }
        assert_eq!(finished, vec![1, 2, 3, 4, 5]);
        assert_eq!(run.in_flight(), 1);

        cancel.cancel();
        assert!(run.next(&cancel).await.is_none());
        assert!(run.drain().await.is_empty());
        assert_eq!(run.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_admit_holds_back_later_rows() {
        let pool = WorkerPool::new(4, Duration::from_secs(1));
        let input = rows(6);
        let cancel = CancellationToken::new();
        let mut run = pool.start(&input, |row: InputRow| async move { row.offset() });

        run.admit(2);
        let first = collect(&mut run, &cancel).await;
        assert_eq!(first.len(), 2);
        assert_eq!(run.remaining(), 4);

        run.admit(6);
        let rest = collect(&mut run, &cancel).await;
        let mut positions: Vec<usize> = rest.iter().map(|s| s.position).collect();
        positions.sort_unstable();
        assert_eq!(positions, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let pool = WorkerPool::new(2, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let input = rows(3);
        let mut run = pool.start(&input, |row: InputRow| async move { row.offset() });

        assert!(run.next(&cancel).await.is_none());
        assert!(run.drain().await.is_empty());
        assert_eq!(run.remaining(), 3);
    }

    #[tokio::test]
    async fn test_empty_input_settles_nothing() {
        let pool = WorkerPool::new(2, Duration::from_secs(1));
        let mut run = pool.start(&[], |row: InputRow| async move { row.offset() });
        assert!(run.next(&CancellationToken::new()).await.is_none());
    }
}
