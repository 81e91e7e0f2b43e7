//! Bounded-parallelism work queue with an idle barrier.
//!
//! One task is enqueued per newly discovered package; tasks may enqueue
//! further tasks. `idle()` is the synchronization barrier between loader
//! passes: no decision about graph stability is made until every task of
//! the current pass has completed. Sibling tasks run in any order; only the
//! idempotent, commutative flag merge makes that race-safe.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

/// A task queue limiting the amount of active work.
#[derive(Clone)]
pub struct WorkQueue {
    limit: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    became_idle: Arc<Notify>,
}

impl WorkQueue {
    /// Create a queue that runs at most `max_active` tasks concurrently.
    pub fn new(max_active: usize) -> Self {
        WorkQueue {
            limit: Arc::new(Semaphore::new(max_active.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            became_idle: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a task. The task starts as soon as a slot is free and may
    /// itself enqueue more tasks.
    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let limit = Arc::clone(&self.limit);
        let pending = Arc::clone(&self.pending);
        let became_idle = Arc::clone(&self.became_idle);
        tokio::spawn(async move {
            let Ok(_permit) = limit.acquire().await else {
                return;
            };
            task.await;
            drop(_permit);
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                became_idle.notify_waiters();
            }
        });
    }

    /// Whether no tasks are pending or running.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
    }

    /// Wait until every enqueued task (including tasks enqueued by other
    /// tasks in the meantime) has completed.
    pub async fn idle(&self) {
        loop {
            let notified = self.became_idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}
