//! Technician availability with atomic per-technician reserve/release
//!
//! `AvailabilityStore` is the only owner of technician state. Each reserve is a
//! check-and-set on one technician's record in the backing cache; there is no
//! collection-wide lock, so independent technicians reserve concurrently.

use crate::domain::error::{DispatchError, StoreError};
use crate::domain::types::{OrderId, TechnicianId, TechnicianRecord};
use crate::infra::config::StoreConfig;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a check-and-set reservation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// Already bound to an order (possibly unknown if the backend does not say)
    Busy(Option<OrderId>),
    UnknownTechnician,
}

/// What a roster sync did to one technician
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted,
    /// Profile refreshed, reservation state untouched
    Refreshed,
}

/// Keyed technician cache with per-key atomic update
#[async_trait]
pub trait AvailabilityCache: Send + Sync {
    async fn get(&self, id: &TechnicianId) -> Result<Option<TechnicianRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<TechnicianRecord>, StoreError>;

    /// Insert as available if unknown, otherwise refresh name and location only
    async fn sync(&self, record: &TechnicianRecord) -> Result<SyncOutcome, StoreError>;

    /// Atomically bind `id` to `order_id` if and only if it is currently available
    async fn compare_and_reserve(
        &self,
        id: &TechnicianId,
        order_id: &OrderId,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Mark available with no order. Returns false for unknown ids.
    async fn release(&self, id: &TechnicianId) -> Result<bool, StoreError>;

    /// Atomically release `id` only while it is bound to `order_id`.
    /// Returns false if it is unknown, available, or held by another order.
    async fn release_if_held(&self, id: &TechnicianId, order_id: &OrderId) -> Result<bool, StoreError>;
}

pub struct AvailabilityStore {
    cache: Arc<dyn AvailabilityCache>,
    op_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl AvailabilityStore {
    pub fn new(cache: Arc<dyn AvailabilityCache>, config: &StoreConfig) -> Self {
        Self { cache, op_timeout: config.op_timeout(), metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bound a cache operation by `op_timeout`
    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, DispatchError> {
        let result = match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout.as_millis() as u64)),
        };
        result.map_err(|e| {
            warn!(op, error = %e, "availability_store_error");
            DispatchError::from(e)
        })
    }

    pub async fn get_all(&self) -> Result<Vec<TechnicianRecord>, DispatchError> {
        self.timed("list", self.cache.list()).await
    }

    pub async fn get(&self, id: &TechnicianId) -> Result<Option<TechnicianRecord>, DispatchError> {
        self.timed("get", self.cache.get(id)).await
    }

    /// True only if this call moved the technician from available to bound
    pub async fn reserve(
        &self,
        id: &TechnicianId,
        order_id: &OrderId,
    ) -> Result<bool, DispatchError> {
        let outcome = self.timed("reserve", self.cache.compare_and_reserve(id, order_id)).await?;
        let won = outcome == ReserveOutcome::Reserved;

        match &outcome {
            ReserveOutcome::Reserved => {
                info!(technician_id = %id, order_id = %order_id, "technician_reserved");
            }
            ReserveOutcome::Busy(current) => {
                debug!(
                    technician_id = %id,
                    order_id = %order_id,
                    current_order_id = ?current.as_ref().map(OrderId::as_str),
                    "technician_busy"
                );
            }
            ReserveOutcome::UnknownTechnician => {
                warn!(technician_id = %id, order_id = %order_id, "reserve_unknown_technician");
            }
        }
        if let Some(m) = &self.metrics {
            m.record_reservation(won);
        }
        Ok(won)
    }

    /// Idempotent; releasing an unknown technician is a logged no-op
    pub async fn release(&self, id: &TechnicianId) -> Result<(), DispatchError> {
        let known = self.timed("release", self.cache.release(id)).await?;
        if known {
            info!(technician_id = %id, "technician_released");
            if let Some(m) = &self.metrics {
                m.record_release();
            }
        } else {
            warn!(technician_id = %id, "release_unknown_technician");
        }
        Ok(())
    }

    /// Release `id` only if `order_id` still holds it. Safe to call for a reserve
    /// whose outcome is unknown; it never frees another order's technician.
    pub async fn release_held(&self, id: &TechnicianId, order_id: &OrderId) -> Result<bool, DispatchError> {
        let released = self.timed("release_held", self.cache.release_if_held(id, order_id)).await?;
        if released {
            info!(technician_id = %id, order_id = %order_id, "technician_released");
            if let Some(m) = &self.metrics {
                m.record_release();
            }
        } else {
            debug!(technician_id = %id, order_id = %order_id, "release_skipped_not_held");
        }
        Ok(released)
    }

    /// Seed from the roster. Existing reservations survive a resync.
    pub async fn sync_roster(&self, records: &[TechnicianRecord]) -> Result<usize, DispatchError> {
        let mut inserted = 0;
        for record in records {
            if self.timed("sync", self.cache.sync(record)).await? == SyncOutcome::Inserted {
                inserted += 1;
            }
        }
        info!(total = records.len(), inserted, "roster_synced");
        Ok(inserted)
    }
}
