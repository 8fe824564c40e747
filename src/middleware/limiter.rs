// Bounded-parallelism primitive with a FIFO wait queue
//
// Backed by tokio's fair semaphore: waiters are granted permits in the order
// they started waiting, so queued tasks start in submission order and
// `running <= max_concurrent` holds at every instant.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{trace, warn};

struct LimiterInner {
    name: &'static str,
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    completed: AtomicU64,
}

/// Concurrency limiter for one resource class (recognition, translation, ...)
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

/// An occupied slot; the permit returns to the semaphore on drop (including panics)
pub struct LimiterSlot {
    _permit: Option<OwnedSemaphorePermit>,
    inner: Arc<LimiterInner>,
}

impl Drop for LimiterSlot {
    fn drop(&mut self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a waiter in `queued` until it gets a permit or is cancelled
struct QueueTicket<'a>(&'a AtomicUsize);

impl<'a> QueueTicket<'a> {
    fn new(queued: &'a AtomicUsize) -> Self {
        queued.fetch_add(1, Ordering::SeqCst);
        Self(queued)
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(name: &'static str, max_concurrent: usize) -> Self {
        if max_concurrent == 0 {
            warn!("{} limiter configured with 0 slots, using 1", name);
        }
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(LimiterInner {
                name,
                max_concurrent,
                semaphore: Arc::new(Semaphore::new(max_concurrent)),
                queued: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Tasks currently holding a slot
    pub fn running(&self) -> usize {
        self.inner.max_concurrent - self.inner.semaphore.available_permits()
    }

    /// Tasks waiting for a slot
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Wait for a slot in FIFO order; the slot is held until the returned value drops
    pub async fn acquire(&self) -> LimiterSlot {
        let permit = {
            let _ticket = QueueTicket::new(&self.inner.queued);
            trace!("{} limiter: waiting ({} queued)", self.inner.name, self.queued());
            Arc::clone(&self.inner.semaphore).acquire_owned().await
        };

        // The semaphore is owned by the limiter and never closed
        let permit = match permit {
            Ok(permit) => Some(permit),
            Err(e) => {
                warn!("{} limiter: {}, running unbounded", self.inner.name, e);
                None
            }
        };

        LimiterSlot {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run `task` once a slot is free and resolve with its own output
    pub async fn run<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        task().await
    }
}
