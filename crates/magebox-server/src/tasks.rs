//! Bounded fire-and-forget work.
//!
//! Emails and key pushes run after the HTTP response has been sent. At most
//! `capacity` of them run at once; the rest wait for a permit. A failure is
//! logged under the task's label and goes nowhere else.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

#[derive(Debug)]
struct Inner {
    permits: Semaphore,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Spawner for background tasks. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(capacity.max(1)),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Run `fut` in the background. Never blocks the caller.
    pub fn spawn<F, E>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let outcome = match inner.permits.acquire().await {
                Ok(_permit) => fut.await.map_err(|e| e.to_string()),
                Err(_) => Err("task queue closed".to_owned()),
            };
            match outcome {
                Ok(()) => debug!(task = label, "background task finished"),
                Err(e) => warn!(task = label, error = %e, "background task failed"),
            }
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    /// Number of tasks spawned but not yet finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Wait for running tasks, giving up after `timeout`. Returns whether
    /// everything finished.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}
