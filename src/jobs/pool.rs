// Worker pool for batch jobs.
//
// A control loop tops up a bounded set of workers from a growable queue,
// reports aggregate progress and sleeps until the next tick, a worker
// finishing, or a new item arriving. It exits once the queue is empty and no
// worker is running; the queue is closed at that moment so late items go to
// a new job instead of being stranded.

use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use super::events::ProgressReporter;
use super::WorkItem;

/// The queue refused an item because it has drained and closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<WorkItem>,
    running: BTreeMap<u64, WorkItem>,
    next_ticket: u64,
    closed: bool,
}

impl QueueState {
    fn contains(&self, item: &WorkItem) -> bool {
        self.pending.contains(item) || self.running.values().any(|r| r == item)
    }
}

/// Thread-safe intake queue plus the set of items currently executing.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let queue = Self::new();
        // A fresh queue is never closed.
        let _ = queue.extend(items);
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one item. Returns false when an equal item is already pending or
    /// running.
    pub fn push(&self, item: WorkItem) -> Result<bool, QueueClosed> {
        let added = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            if state.contains(&item) {
                false
            } else {
                state.pending.push_back(item);
                true
            }
        };
        if added {
            self.wake.notify_one();
        }
        Ok(added)
    }

    /// Add several items; returns how many were new.
    pub fn extend(&self, items: impl IntoIterator<Item = WorkItem>) -> Result<usize, QueueClosed> {
        let added = {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueClosed);
            }
            let mut added = 0;
            for item in items {
                if !state.contains(&item) {
                    state.pending.push_back(item);
                    added += 1;
                }
            }
            added
        };
        if added > 0 {
            self.wake.notify_one();
        }
        Ok(added)
    }

    fn start_next(&self) -> Option<(u64, WorkItem)> {
        let mut state = self.lock();
        let item = state.pending.pop_front()?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.running.insert(ticket, item.clone());
        Some((ticket, item))
    }

    fn finish(&self, ticket: u64) {
        self.lock().running.remove(&ticket);
    }

    /// Close the queue if nothing is pending or running. Returns whether it
    /// is closed afterwards.
    fn close_if_drained(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_empty() && state.running.is_empty() {
            state.closed = true;
        }
        state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// (running, pending)
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.running.len(), state.pending.len())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Unfinished items, running ones first.
    pub fn snapshot(&self) -> Vec<WorkItem> {
        let state = self.lock();
        state
            .running
            .values()
            .chain(state.pending.iter())
            .cloned()
            .collect()
    }

    /// Replace the pending items. Only used before the job starts.
    pub fn reset(&self, items: Vec<WorkItem>) {
        let mut state = self.lock();
        state.pending = items.into();
    }
}

/// Per-item progress lines, guarded separately from the queue so rendering
/// never races with pruning.
#[derive(Default)]
pub struct ProgressBoard {
    lines: Mutex<BTreeMap<u64, String>>,
}

impl ProgressBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, ticket: u64, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ticket, line);
    }

    fn remove(&self, ticket: u64) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ticket);
    }

    pub fn render(&self) -> String {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle a worker uses to publish its own progress line.
#[derive(Clone)]
pub struct ItemProgress {
    ticket: u64,
    board: Arc<ProgressBoard>,
}

impl ItemProgress {
    pub fn set(&self, line: impl Into<String>) {
        self.board.set(self.ticket, line.into());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub succeeded: usize,
    pub abandoned: usize,
}

pub struct WorkerPool {
    limit: usize,
    tick: Duration,
}

impl WorkerPool {
    pub fn new(limit: usize, tick: Duration) -> Self {
        Self {
            limit: limit.max(1),
            tick,
        }
    }

    /// Drain `queue`, running at most `limit` items at once. Item failures
    /// are logged and counted; they never stop the pool.
    pub async fn run<F, Fut>(
        &self,
        queue: Arc<WorkQueue>,
        board: Arc<ProgressBoard>,
        progress: &ProgressReporter,
        process: F,
    ) -> PoolStats
    where
        F: Fn(WorkItem, ItemProgress) -> Fut,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(u64, bool)>();
        let mut stats = PoolStats::default();
        let mut finished: Vec<(u64, bool)> = Vec::new();

        loop {
            // Reap
            while let Ok(done) = done_rx.try_recv() {
                finished.push(done);
            }
            for (ticket, ok) in finished.drain(..) {
                queue.finish(ticket);
                board.remove(ticket);
                if ok {
                    stats.succeeded += 1;
                } else {
                    stats.abandoned += 1;
                }
            }

            // Top up
            while queue.counts().0 < self.limit {
                let Some((ticket, item)) = queue.start_next() else {
                    break;
                };
                let label = item.label();
                let line = ItemProgress {
                    ticket,
                    board: board.clone(),
                };
                line.set(label.clone());

                let work = process(item, line);
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let ok = match AssertUnwindSafe(work).catch_unwind().await {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            tracing::warn!("Abandoned {}: {:#}", label, e);
                            false
                        }
                        Err(_) => {
                            tracing::error!("Worker for {} panicked", label);
                            false
                        }
                    };
                    let _ = done_tx.send((ticket, ok));
                });
            }

            let (running, pending) = queue.counts();
            if running == 0 && queue.close_if_drained() {
                break;
            }

            let lines = board.render();
            let message = if lines.is_empty() {
                format!("{}/{}", running, running + pending)
            } else {
                format!("{}/{}\n{}", running, running + pending, lines)
            };
            progress.report(running, running + pending, message);

            tokio::select! {
                Some(done) = done_rx.recv() => finished.push(done),
                _ = queue.wake.notified() => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        }

        progress.report(
            stats.succeeded,
            stats.succeeded + stats.abandoned,
            format!("{} done, {} abandoned", stats.succeeded, stats.abandoned),
        );
        stats
    }
}
