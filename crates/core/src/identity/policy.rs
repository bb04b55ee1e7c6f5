//! When a login should touch the stored account.

use serde::{Deserialize, Serialize};

/// Account-maintenance switches (`create.users`, `update.info`,
/// `update.roles`, `update.last.login`). All default to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPolicy {
    /// Create a local account the first time an unknown principal logs in.
    pub create_users: bool,
    /// Refresh full name and email on every login, not just the first.
    pub update_info: bool,
    /// Recompute memberships on every login, not just the first.
    pub update_roles: bool,
    /// Record the login time whenever account information is written.
    pub update_last_login: bool,
}

impl LoginPolicy {
    /// Memberships are always computed for a freshly created principal.
    pub fn should_update_roles(&self, new_principal: bool) -> bool {
        new_principal || self.update_roles
    }

    pub fn should_update_info(&self, new_principal: bool) -> bool {
        new_principal || self.update_info
    }

    /// The last-login timestamp is written together with account
    /// information, never on its own.
    pub fn should_update_last_login(&self, new_principal: bool) -> bool {
        self.update_last_login && self.should_update_info(new_principal)
    }
}
