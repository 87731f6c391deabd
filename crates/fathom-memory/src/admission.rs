//! Admission control for graph searches.
//!
//! A single semaphore bounds how many searches run at once across every
//! bank. Excess requests wait for a permit (up to an optional timeout)
//! instead of slowing down searches already in flight. How much work each
//! admitted search does is bounded by its thinking budget, not here.

use fathom_types::config::ConcurrencyConfig;
use fathom_types::error::{FathomError, FathomResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Occupancy snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    /// Searches currently holding a permit.
    pub active: usize,
    /// Maximum concurrent searches.
    pub capacity: usize,
}

/// Permit held for the duration of one search. Dropping it releases the slot.
#[derive(Debug)]
pub struct SearchPermit {
    _permit: OwnedSemaphorePermit,
}

/// System-wide gate on concurrent searches.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    sem: Arc<Semaphore>,
    capacity: usize,
    wait: Option<Duration>,
}

impl AdmissionController {
    /// Create a controller admitting `capacity` searches, waiting at most
    /// `wait` for a slot (`None` waits indefinitely).
    pub fn new(capacity: usize, wait: Option<Duration>) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(capacity)),
            capacity,
            wait,
        }
    }

    /// Create from the `[concurrency]` config section.
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self::new(
            config.max_concurrent_searches,
            config.admission_timeout_ms.map(Duration::from_millis),
        )
    }

    /// Wait for a slot. Fails with `Capacity` once the wait timeout elapses.
    pub async fn acquire(&self) -> FathomResult<SearchPermit> {
        let acquire = self.sem.clone().acquire_owned();
        let permit = match self.wait {
            Some(wait) => match tokio::time::timeout(wait, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(
                        capacity = self.capacity,
                        wait_ms = wait.as_millis() as u64,
                        "Search admission timed out"
                    );
                    return Err(FathomError::Capacity(format!(
                        "{} searches already in flight; no slot within {}ms",
                        self.capacity,
                        wait.as_millis()
                    )));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| FathomError::Capacity("admission gate is closed".into()))?;
        debug!(active = self.occupancy().active, "Search admitted");
        Ok(SearchPermit { _permit: permit })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> FathomResult<SearchPermit> {
        self.sem
            .clone()
            .try_acquire_owned()
            .map(|permit| SearchPermit { _permit: permit })
            .map_err(|_| {
                FathomError::Capacity(format!("{} searches already in flight", self.capacity))
            })
    }

    /// Current occupancy.
    pub fn occupancy(&self) -> Occupancy {
        Occupancy {
            active: self.capacity.saturating_sub(self.sem.available_permits()),
            capacity: self.capacity,
        }
    }

    /// Stop admitting; waiting and future acquires fail with `Capacity`.
    pub fn close(&self) {
        self.sem.close();
    }
}
