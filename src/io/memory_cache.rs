//! In-process availability cache
//!
//! One mutex per technician. The outer map is write-locked only when a roster
//! sync inserts a new technician; reserve and release take the read lock just
//! long enough to clone the entry handle.

use crate::domain::error::StoreError;
use crate::domain::types::{HasAvailability, OrderId, TechnicianId, TechnicianRecord};
use crate::services::availability::{AvailabilityCache, ReserveOutcome, SyncOutcome};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::Arc;

type Entry = Arc<Mutex<TechnicianRecord>>;

#[derive(Default)]
pub struct InMemoryAvailabilityCache {
    entries: RwLock<FxHashMap<TechnicianId, Entry>>,
}

impl InMemoryAvailabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn entry(&self, id: &TechnicianId) -> Option<Entry> {
        self.entries.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AvailabilityCache for InMemoryAvailabilityCache {
    async fn get(&self, id: &TechnicianId) -> Result<Option<TechnicianRecord>, StoreError> {
        Ok(self.entry(id).map(|e| e.lock().clone()))
    }

    async fn list(&self) -> Result<Vec<TechnicianRecord>, StoreError> {
        let handles: Vec<Entry> = self.entries.read().values().cloned().collect();
        let mut records: Vec<TechnicianRecord> = handles.iter().map(|e| e.lock().clone()).collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(records)
    }

    async fn sync(&self, record: &TechnicianRecord) -> Result<SyncOutcome, StoreError> {
        if let Some(entry) = self.entry(record.id()) {
            entry.lock().refresh_profile(record);
            return Ok(SyncOutcome::Refreshed);
        }

        let mut entries = self.entries.write();
        // Another sync may have inserted it between the read and write lock
        if let Some(entry) = entries.get(record.id()) {
            entry.lock().refresh_profile(record);
            return Ok(SyncOutcome::Refreshed);
        }
        let mut fresh = record.clone();
        fresh.release();
        entries.insert(record.id().clone(), Arc::new(Mutex::new(fresh)));
        Ok(SyncOutcome::Inserted)
    }

    async fn compare_and_reserve(
        &self,
        id: &TechnicianId,
        order_id: &OrderId,
    ) -> Result<ReserveOutcome, StoreError> {
        let Some(entry) = self.entry(id) else {
            return Ok(ReserveOutcome::UnknownTechnician);
        };

        let mut record = entry.lock();
        if !record.is_available() {
            return Ok(ReserveOutcome::Busy(record.current_order_id().cloned()));
        }
        record.assign(order_id.clone());
        Ok(ReserveOutcome::Reserved)
    }

    async fn release(&self, id: &TechnicianId) -> Result<bool, StoreError> {
        match self.entry(id) {
            Some(entry) => {
                entry.lock().release();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_if_held(&self, id: &TechnicianId, order_id: &OrderId) -> Result<bool, StoreError> {
        let Some(entry) = self.entry(id) else {
            return Ok(false);
        };

        let mut record = entry.lock();
        if record.current_order_id() != Some(order_id) {
            return Ok(false);
        }
        record.release();
        Ok(true)
    }
}
