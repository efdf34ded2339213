//! IO modules - external system interfaces
//!
//! - `geocoder` - Nominatim client and the language-fallback `GeoCoder`
//! - `route_provider` - OpenRouteService directions client
//! - `polyline` - Encoded route path codec
//! - `memory_cache` / `redis_cache` - Availability cache backends
//! - `fleet` - Static fleet file (stock directory and technician roster)
//! - `egress` - Assignment output to file (JSONL format)
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod fleet;
pub mod geocoder;
pub mod memory_cache;
pub mod polyline;
pub mod prometheus;
pub mod redis_cache;
pub mod route_provider;

// Re-export commonly used types
pub use egress::JsonlAssignmentSink;
pub use fleet::FleetFile;
pub use geocoder::{GeoCoder, GeocodingProvider, NominatimClient};
pub use memory_cache::InMemoryAvailabilityCache;
pub use redis_cache::RedisAvailabilityCache;
pub use route_provider::{OpenRouteServiceClient, RouteProvider, TRAFFIC_BUFFER};
