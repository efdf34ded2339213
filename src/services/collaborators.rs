//! Contracts the engine consumes from upstream systems

use crate::domain::error::StoreError;
use crate::domain::requirement::StockRequirement;
use crate::domain::types::{Assignment, TechnicianRecord, WarehouseCandidate};
use async_trait::async_trait;

/// Warehouse stock lookup
#[async_trait]
pub trait StockDirectory: Send + Sync {
    /// Every known warehouse, flagged with whether it can cover `requirement`
    async fn warehouses_for(
        &self,
        requirement: &StockRequirement,
    ) -> Result<Vec<WarehouseCandidate>, StoreError>;
}

/// Source of truth for which technicians exist and where they are based
#[async_trait]
pub trait TechnicianRoster: Send + Sync {
    async fn technicians(&self) -> Result<Vec<TechnicianRecord>, StoreError>;
}

/// Order persistence; receives each successful assignment
#[async_trait]
pub trait AssignmentSink: Send + Sync {
    async fn record(&self, assignment: &Assignment) -> Result<(), StoreError>;
}
