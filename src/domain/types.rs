//! Shared value types for the dispatch engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Order identifier, issued by the order-persistence collaborator
    OrderId
);
string_id!(
    /// Technician identifier, issued by the roster collaborator
    TechnicianId
);
string_id!(
    /// Warehouse identifier, issued by the stock collaborator
    WarehouseId
);

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("coordinate out of range: latitude={latitude}, longitude={longitude}")]
pub struct InvalidCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// WGS84 point. Latitude in [-90, 90], longitude in [-180, 180].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = InvalidCoordinate;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, InvalidCoordinate> {
        let in_range = (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude);
        if in_range {
            Ok(Self { latitude, longitude })
        } else {
            Err(InvalidCoordinate { latitude, longitude })
        }
    }

    #[inline]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[inline]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// (0, 0) is what upstream systems store for "never located"
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// Anything with a fixed position on the map
pub trait HasLocation {
    fn location(&self) -> Coordinate;
}

/// Anything that can be busy with an order
pub trait HasAvailability {
    fn is_available(&self) -> bool;
    fn current_order_id(&self) -> Option<&OrderId>;
}

/// A geocoder hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoResult {
    pub coordinate: Coordinate,
    pub display_name: String,
    pub importance: f64,
}

/// Warehouse as reported by the stock collaborator for one requirement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseCandidate {
    pub id: WarehouseId,
    #[serde(default)]
    pub name: Option<String>,
    pub coordinate: Coordinate,
    pub stock_sufficient: bool,
}

impl HasLocation for WarehouseCandidate {
    fn location(&self) -> Coordinate {
        self.coordinate
    }
}

/// Technician availability record.
///
/// `is_available == false` exactly when `current_order_id` is set. Fields are private so
/// the only way to flip state is `assign` / `release`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTechnicianRecord")]
pub struct TechnicianRecord {
    id: TechnicianId,
    name: Option<String>,
    coordinate: Coordinate,
    is_available: bool,
    current_order_id: Option<OrderId>,
}

#[derive(Deserialize)]
struct RawTechnicianRecord {
    id: TechnicianId,
    #[serde(default)]
    name: Option<String>,
    coordinate: Coordinate,
    is_available: bool,
    #[serde(default)]
    current_order_id: Option<OrderId>,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("technician {id}: is_available={is_available} contradicts current_order_id={current_order_id:?}")]
pub struct InconsistentTechnician {
    pub id: TechnicianId,
    pub is_available: bool,
    pub current_order_id: Option<OrderId>,
}

impl TryFrom<RawTechnicianRecord> for TechnicianRecord {
    type Error = InconsistentTechnician;

    fn try_from(raw: RawTechnicianRecord) -> Result<Self, Self::Error> {
        TechnicianRecord::from_parts(
            raw.id,
            raw.name,
            raw.coordinate,
            raw.is_available,
            raw.current_order_id,
        )
    }
}

impl TechnicianRecord {
    /// A free technician, as produced by roster sync
    pub fn available(id: TechnicianId, coordinate: Coordinate) -> Self {
        Self { id, name: None, coordinate, is_available: true, current_order_id: None }
    }

    /// Rebuild a record read back from a cache, checking the availability invariant
    pub fn from_parts(
        id: TechnicianId,
        name: Option<String>,
        coordinate: Coordinate,
        is_available: bool,
        current_order_id: Option<OrderId>,
    ) -> Result<Self, InconsistentTechnician> {
        if is_available == current_order_id.is_none() {
            Ok(Self { id, name, coordinate, is_available, current_order_id })
        } else {
            Err(InconsistentTechnician { id, is_available, current_order_id })
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn id(&self) -> &TechnicianId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    /// Bind to an order. Caller must have checked availability under the same lock.
    pub fn assign(&mut self, order_id: OrderId) {
        self.is_available = false;
        self.current_order_id = Some(order_id);
    }

    pub fn release(&mut self) {
        self.is_available = true;
        self.current_order_id = None;
    }

    /// Take name and location from a roster entry, keeping reservation state
    pub fn refresh_profile(&mut self, roster: &TechnicianRecord) {
        self.name = roster.name.clone();
        self.coordinate = roster.coordinate;
    }
}

impl HasLocation for TechnicianRecord {
    fn location(&self) -> Coordinate {
        self.coordinate
    }
}

impl HasAvailability for TechnicianRecord {
    fn is_available(&self) -> bool {
        self.is_available
    }

    fn current_order_id(&self) -> Option<&OrderId> {
        self.current_order_id.as_ref()
    }
}

/// Driving route between two points
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    /// Kilometres, 2 decimals
    pub distance_km: f64,
    /// Minutes, 2 decimals, includes the 1.2x traffic buffer
    pub duration_min: f64,
    pub path: Vec<Coordinate>,
    pub is_via_warehouse: bool,
}

/// Outcome of a successful dispatch, handed to the order-persistence collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub dispatch_id: String,
    pub order_id: OrderId,
    pub order_location: GeoResult,
    pub warehouse_id: WarehouseId,
    pub technician_ids: BTreeSet<TechnicianId>,
    pub routes_by_technician: BTreeMap<TechnicianId, RouteResult>,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
