//! Persistence layer: atomic file writes, locking, and the individual
//! stores for plan, recovery, memory, status, and metrics state.

pub mod atomic;
pub mod memory;
pub mod metrics;
pub mod plan;
pub mod recovery;
pub mod status;

pub use memory::MemoryStore;
pub use metrics::MetricsStore;
pub use plan::PlanStore;
pub use recovery::RecoveryStore;
pub use status::StatusStore;
