//! Dispatch engine library
//!
//! Geocodes service orders, ranks warehouses and technicians by driving time,
//! and reserves crews atomically. Exposes modules for integration testing and
//! binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
