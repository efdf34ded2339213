//! Admission gate for rate-limited third-party providers
//!
//! One permit at a time, a bounded wait for it, and a minimum spacing between
//! successive admissions. Shared by `Arc` between every caller of a provider.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("admission not granted within {waited_ms} ms")]
pub struct AdmissionTimeout {
    pub waited_ms: u64,
}

/// Held while the admitted call is in flight
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max_wait: Duration,
    min_interval: Duration,
    last_admitted: Mutex<Option<Instant>>,
}

impl AdmissionGate {
    pub fn new(max_wait: Duration, min_interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            max_wait,
            min_interval,
            last_admitted: Mutex::new(None),
        }
    }

    pub fn from_millis(max_wait_ms: u64, min_interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(max_wait_ms), Duration::from_millis(min_interval_ms))
    }

    /// Wait for the permit (bounded by `max_wait`), then honour the minimum interval
    /// since the previous admission.
    pub async fn admit(&self) -> Result<AdmissionPermit, AdmissionTimeout> {
        let permit = match tokio::time::timeout(
            self.max_wait,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // Closed semaphore is never produced here; treat like a timeout
            Ok(Err(_)) | Err(_) => {
                return Err(AdmissionTimeout { waited_ms: self.max_wait.as_millis() as u64 })
            }
        };

        let wait = {
            let last = self.last_admitted.lock();
            last.map(|t| self.min_interval.saturating_sub(t.elapsed())).unwrap_or_default()
        };
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "admission_spacing");
            tokio::time::sleep(wait).await;
        }
        *self.last_admitted.lock() = Some(Instant::now());

        Ok(AdmissionPermit { _permit: permit })
    }
}
