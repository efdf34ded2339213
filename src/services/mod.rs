//! Services - dispatch logic and technician state
//!
//! - `availability` - Technician availability with per-technician check-and-set
//! - `collaborators` - Upstream contracts (stock, roster, order persistence)
//! - `ranker` - Two-phase warehouse/technician ranking
//! - `orchestrator` - End-to-end dispatch with compensation

pub mod availability;
pub mod collaborators;
pub mod orchestrator;
pub mod ranker;

// Re-export commonly used types
pub use availability::{AvailabilityCache, AvailabilityStore, ReserveOutcome, SyncOutcome};
pub use collaborators::{AssignmentSink, StockDirectory, TechnicianRoster};
pub use orchestrator::{DispatchOrchestrator, DispatchRequest};
pub use ranker::CandidateRanker;
