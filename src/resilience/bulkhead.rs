//! Bulkhead - Concurrency Isolation
//! Caps in-flight work per class of calls, with an optional bounded wait queue

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::BulkheadFullError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    pub name: String,
    pub max_concurrent: usize,
    /// Waiters allowed beyond `max_concurrent`; `None` waits without bound.
    pub max_queue: Option<usize>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrent: 10,
            max_queue: Some(100),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkheadMetrics {
    pub name: String,
    pub max_concurrent: usize,
    pub max_queue: Option<usize>,
    pub active: usize,
    pub queued: usize,
    pub available_permits: usize,
}

/// Slot held for the duration of one call; released on drop.
#[derive(Debug)]
pub struct BulkheadPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Queued<'a>(&'a AtomicUsize);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Bulkhead {
    config: BulkheadConfig,
    // tokio's semaphore hands released permits to the oldest waiter first.
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    queued: AtomicUsize,
}

impl Bulkhead {
    pub fn new(config: BulkheadConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            active: Arc::new(AtomicUsize::new(0)),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn full_error(&self) -> BulkheadFullError {
        BulkheadFullError {
            name: self.config.name.clone(),
            queued: self.queued.load(Ordering::Acquire),
        }
    }

    fn permit(&self, permit: OwnedSemaphorePermit) -> BulkheadPermit {
        self.active.fetch_add(1, Ordering::AcqRel);
        BulkheadPermit {
            _permit: permit,
            active: self.active.clone(),
        }
    }

    /// Take a slot, queueing if all are busy. Fails at once when the queue
    /// is bounded and already full.
    pub async fn acquire(&self) -> Result<BulkheadPermit, BulkheadFullError> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Ok(self.permit(permit));
        }

        match self.config.max_queue {
            Some(max_queue) => {
                let reserved = self
                    .queued
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| {
                        (q < max_queue).then_some(q + 1)
                    });
                if reserved.is_err() {
                    warn!(
                        name = %self.config.name,
                        max_queue = max_queue,
                        "Bulkhead queue full, rejecting call"
                    );
                    return Err(self.full_error());
                }
            }
            None => {
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
        }
        let queued = Queued(&self.queued);
        debug!(name = %self.config.name, "Bulkhead saturated, queueing call");

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.full_error())?;
        drop(queued);

        Ok(self.permit(permit))
    }

    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<BulkheadFullError>,
    {
        let _permit = self.acquire().await?;
        operation().await
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            name: self.config.name.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queue: self.config.max_queue,
            active: self.active.load(Ordering::Acquire),
            queued: self.queued.load(Ordering::Acquire),
            available_permits: self.semaphore.available_permits(),
        }
    }
}
