//! Error taxonomy for dispatch and its external collaborators

use crate::domain::types::TechnicianId;
use thiserror::Error;

/// Terminal outcome of a failed dispatch (or of a core component call)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("geocoding unavailable for address {address:?}")]
    GeocodingUnavailable { address: String },
    #[error("no route found: {0}")]
    NoRouteFound(String),
    #[error("no warehouse holds sufficient stock")]
    NoStockAvailable,
    #[error("not enough technicians available: needed {needed}, found {found}")]
    NoTechnicianAvailable { needed: usize, found: usize },
    #[error("technician {0} was reserved by a concurrent dispatch")]
    ReservationConflict(TechnicianId),
    #[error("provider timed out: {0}")]
    ProviderTimeout(String),
    #[error("malformed provider response: {0}")]
    MalformedProviderResponse(String),
    #[error("availability store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("invalid dispatch request: {0}")]
    InvalidRequest(String),
}

/// Stable labels, indexed by `DispatchError::kind_index`
pub const DISPATCH_ERROR_KINDS: [&str; 9] = [
    "geocoding_unavailable",
    "no_route_found",
    "no_stock_available",
    "no_technician_available",
    "reservation_conflict",
    "provider_timeout",
    "malformed_provider_response",
    "store_unavailable",
    "invalid_request",
];

impl DispatchError {
    pub fn kind_index(&self) -> usize {
        match self {
            DispatchError::GeocodingUnavailable { .. } => 0,
            DispatchError::NoRouteFound(_) => 1,
            DispatchError::NoStockAvailable => 2,
            DispatchError::NoTechnicianAvailable { .. } => 3,
            DispatchError::ReservationConflict(_) => 4,
            DispatchError::ProviderTimeout(_) => 5,
            DispatchError::MalformedProviderResponse(_) => 6,
            DispatchError::StoreUnavailable(_) => 7,
            DispatchError::InvalidRequest(_) => 8,
        }
    }

    /// snake_case label for logs and metrics
    pub fn kind(&self) -> &'static str {
        DISPATCH_ERROR_KINDS[self.kind_index()]
    }

    /// Whether the same request may succeed if simply retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ProviderTimeout(_)
                | DispatchError::StoreUnavailable(_)
                | DispatchError::GeocodingUnavailable { .. }
        )
    }
}

/// Failure talking to an HTTP provider (geocoder or router)
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("timed out")]
    Timeout,
}

impl ProviderError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

impl From<ProviderError> for DispatchError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Timeout => DispatchError::ProviderTimeout(e.to_string()),
            ProviderError::Malformed(msg) => DispatchError::MalformedProviderResponse(msg),
            other => DispatchError::NoRouteFound(other.to_string()),
        }
    }
}

/// Failure of the availability cache backend
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("availability cache unreachable: {0}")]
    Unreachable(String),
    #[error("availability cache operation timed out after {0} ms")]
    Timeout(u64),
    #[error("corrupt record for technician {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl From<StoreError> for DispatchError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(_) => DispatchError::ProviderTimeout(e.to_string()),
            other => DispatchError::StoreUnavailable(other.to_string()),
        }
    }
}
