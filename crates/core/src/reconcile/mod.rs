//! Group-membership reconciliation against a host identity store.

pub mod engine;
pub mod memory;
pub mod store;

pub use engine::{Operation, ReconcilePlan, ReconcileReport, Reconciler, SkippedMutation};
pub use memory::MemoryStore;
pub use store::IdentityStore;
