//! shibmap core library.
//!
//! This crate maps identity attributes asserted by a federation front end
//! (Shibboleth headers) onto a local account: declarative match/transform
//! rules, the registry that binds them to attribute channels, the pipeline
//! that expands raw values, membership reconciliation, and the immutable,
//! reloadable configuration snapshot they all read from.

pub mod config;
pub mod errors;
pub mod identity;
pub mod pipeline;
pub mod properties;
pub mod reconcile;
pub mod registry;
pub mod reload;
pub mod rule;
pub mod snapshot;
pub mod text;

// Re-exports for convenience.
pub use config::{build_snapshot, load_snapshot, Settings};
pub use errors::CoreError;
pub use identity::{AttributeSet, AuthOutcome, IdentityResolver, LoginPolicy, ResolvedIdentity};
pub use pipeline::{Candidates, Pipeline, TieBreak};
pub use properties::PropertySource;
pub use reconcile::{IdentityStore, MemoryStore, ReconcilePlan, ReconcileReport, Reconciler};
pub use registry::RuleRegistry;
pub use reload::ReloadSupervisor;
pub use rule::{Rule, RuleSpec};
pub use snapshot::Snapshot;
