//! Infrastructure - configuration, metrics, and admission control
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `rate_limiter` - Admission gate for rate-limited providers

pub mod config;
pub mod metrics;
pub mod rate_limiter;

// Re-export commonly used types
pub use config::{Config, StoreBackend};
pub use metrics::Metrics;
pub use rate_limiter::{AdmissionGate, AdmissionTimeout};
