//! Error types for the shibmap core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! None of these errors is fatal to a login. Loaders drop the offending rule
//! and keep going, the reload supervisor keeps serving the previous snapshot,
//! and the reconciliation engine records a skipped mutation and moves on.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Membership(#[from] MembershipError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from reading a configuration source.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The file exists but its contents could not be parsed.
    #[error("configuration parse error in '{path}': {detail}")]
    ParseError { path: String, detail: String },

    /// A config value is invalid.
    #[error("invalid configuration value for '{key}': {detail}")]
    InvalidValue { key: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Rule errors
// ---------------------------------------------------------------------------

/// Problems found while building rules from configuration. Each one drops a
/// single rule (or a single binding) and is reported as a warning.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuleError {
    /// The `match` pattern is not a valid regular expression.
    #[error("rule '{label}' has an invalid match pattern '{pattern}': {detail}")]
    Compile {
        label: String,
        pattern: String,
        detail: String,
    },

    /// A channel references a rule label that has no definition.
    #[error("channel '{channel}' references undefined rule '{label}'")]
    UnknownLabel { channel: String, label: String },

    /// A pairwise `pattern, replacement` list has a dangling entry.
    #[error("replacement list '{key}' has an odd number of entries ({count}); the last one is ignored")]
    OddReplacementList { key: String, count: usize },
}

// ---------------------------------------------------------------------------
// Identity store errors
// ---------------------------------------------------------------------------

/// Errors reported by an [`IdentityStore`](crate::reconcile::IdentityStore)
/// implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The principal is unknown to the store.
    #[error("principal not found: {0}")]
    PrincipalNotFound(String),

    /// The group is unknown to the store.
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Any other backend failure.
    #[error("identity store error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Membership errors
// ---------------------------------------------------------------------------

/// Why a single membership mutation was skipped during reconciliation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// The target group does not exist and auto-creation is disabled.
    #[error("group '{0}' does not exist and auto-create is disabled")]
    GroupNotFound(String),

    /// The principal is administratively inactive; no groups are granted.
    #[error("principal '{0}' is inactive")]
    PrincipalInactive(String),

    /// The store rejected the add/remove call.
    #[error("failed to {operation} membership in '{role}': {source}")]
    MutationFailed {
        operation: &'static str,
        role: String,
        #[source]
        source: StoreError,
    },
}
