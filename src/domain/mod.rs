//! Domain models - value types, errors and geometry
//!
//! This module contains the canonical data types used throughout the engine:
//! - `Coordinate` - validated WGS84 point
//! - `TechnicianRecord` - technician availability, invariant enforced by the type
//! - `WarehouseCandidate` - warehouse as seen for one stock requirement
//! - `RouteResult` / `Assignment` - routing and dispatch outcomes
//! - `DispatchError` - terminal error taxonomy

pub mod error;
pub mod geo;
pub mod requirement;
pub mod types;

// Re-export commonly used types at module level
pub use error::{DispatchError, ProviderError, StoreError};
pub use geo::{haversine_km, round2};
pub use requirement::{OrderType, StockRequirement};
pub use types::{
    Assignment, Coordinate, GeoResult, HasAvailability, HasLocation, InvalidCoordinate, OrderId,
    RouteResult, TechnicianId, TechnicianRecord, WarehouseCandidate, WarehouseId,
};
