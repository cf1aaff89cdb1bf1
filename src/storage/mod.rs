//! Storage for simulation records.
//!
//! [`SimulationStore`] is the abstract interface. The in-memory backend is
//! always available; the durable WAL-backed backend sits behind the
//! `persistent` feature.

mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemorySimulationStore;
pub(crate) use traits::{apply_update, sort_recent_first};
pub use traits::{CasOutcome, SimulationStore, StatusUpdate, StorageError};
