//! The identity-store capability the reconciliation engine drives.
//!
//! Implemented by the host integration. Every call should be idempotent or
//! at least tolerate redundant calls: two concurrent logins for the same
//! principal may both try the same mutation.

use std::collections::BTreeSet;
use std::fmt;

use crate::errors::StoreError;

/// Group and membership operations on the host's user directory.
pub trait IdentityStore: Send + Sync {
    /// Handle for a user account.
    type Principal: fmt::Display;
    /// Handle for a group.
    type Group;

    /// Look up a group by name. `Ok(None)` when it does not exist.
    fn resolve_group(&self, name: &str) -> Result<Option<Self::Group>, StoreError>;

    /// Create a group. Creating an existing group should return it.
    fn create_group(&self, name: &str) -> Result<Self::Group, StoreError>;

    fn is_member(&self, principal: &Self::Principal, group: &Self::Group) -> Result<bool, StoreError>;

    fn add_membership(&self, principal: &Self::Principal, group: &Self::Group) -> Result<(), StoreError>;

    fn remove_membership(&self, principal: &Self::Principal, group: &Self::Group) -> Result<(), StoreError>;

    /// Names of every group the principal currently belongs to.
    fn list_current_role_names(&self, principal: &Self::Principal) -> Result<BTreeSet<String>, StoreError>;

    /// Whether the account is enabled. Inactive principals gain no groups.
    fn is_active(&self, principal: &Self::Principal) -> Result<bool, StoreError>;
}
