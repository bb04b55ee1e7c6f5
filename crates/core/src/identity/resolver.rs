//! Resolve one request's asserted identity against a snapshot.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, warn};

use super::attributes::AttributeSet;
use super::outcome::AuthOutcome;
use crate::pipeline::Pipeline;
use crate::registry::{FULLNAME_CHANNEL, USERNAME_CHANNEL};
use crate::snapshot::Snapshot;
use crate::text::legacy_utf8_fix;

/// Everything the host needs to create or update a principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub username: String,
    pub full_name: String,
    pub email: Option<String>,
    /// Default roles plus every role discovered from the attributes.
    pub desired_roles: BTreeSet<String>,
}

/// Applies one snapshot's username, full-name and group rules to request
/// attributes. Borrowing the snapshot keeps a whole request on one
/// configuration state.
#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver<'s> {
    snapshot: &'s Snapshot,
}

impl<'s> IdentityResolver<'s> {
    pub fn new(snapshot: &'s Snapshot) -> Self {
        Self { snapshot }
    }

    /// Resolve a federated login. Other outcomes are not mapped.
    pub fn resolve_outcome(&self, outcome: &AuthOutcome, attrs: &AttributeSet) -> Option<ResolvedIdentity> {
        if !outcome.is_federated() {
            return None;
        }
        self.resolve(outcome.principal_name(), attrs)
    }

    /// Resolve the identity asserted for one request.
    ///
    /// The username comes from `remote_user`, or from the configured
    /// remote-user attribute when none was supplied. Returns `None` when no
    /// non-empty username can be derived.
    pub fn resolve(&self, remote_user: Option<&str>, attrs: &AttributeSet) -> Option<ResolvedIdentity> {
        let raw = remote_user
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let header = self.snapshot.settings.headers.remote_user.as_deref()?;
                attrs.first_token(header)
            });
        let Some(raw) = raw else {
            debug!("no remote user asserted");
            return None;
        };

        let username = self.username(&raw)?;
        let full_name = self.full_name(attrs, &username);
        let email = self.email(attrs);
        let desired_roles = self.desired_roles(attrs);

        debug!(
            username = %username,
            full_name = %full_name,
            email = ?email,
            roles = desired_roles.len(),
            "identity resolved"
        );

        Some(ResolvedIdentity {
            username,
            full_name,
            email,
            desired_roles,
        })
    }

    /// Sanitize a raw remote user name. `None` when nothing is left.
    pub fn username(&self, raw: &str) -> Option<String> {
        let snap = self.snapshot;
        let picked = Pipeline::new(&snap.username, snap.name_options())
            .pick(USERNAME_CHANNEL, raw, snap.settings.tie_break)
            .unwrap_or_else(|| raw.to_string());

        let replaced = snap.username_replace.apply(&picked);
        let username = if snap.settings.username_convert_case {
            replaced.trim().to_lowercase()
        } else {
            replaced.trim().to_string()
        };

        if username.is_empty() {
            warn!(raw, "username is empty after sanitization");
            return None;
        }
        Some(username)
    }

    /// Display name from the configured attribute, falling back to
    /// `username`.
    pub fn full_name(&self, attrs: &AttributeSet, username: &str) -> String {
        let snap = self.snapshot;
        let Some(raw) = snap
            .settings
            .headers
            .fullname
            .as_deref()
            .and_then(|header| attrs.first_token(header))
        else {
            return username.to_string();
        };

        let formatted = if snap.fullname.is_bound(FULLNAME_CHANNEL) {
            Pipeline::new(&snap.fullname, snap.name_options())
                .pick(FULLNAME_CHANNEL, &raw, snap.settings.tie_break)
                .unwrap_or_else(|| username.to_string())
        } else if snap.settings.convert_to_utf8 {
            legacy_utf8_fix(&raw).into_owned()
        } else {
            raw
        };

        let full_name = snap.fullname_replace.apply(&formatted).trim().to_string();
        if full_name.is_empty() {
            username.to_string()
        } else {
            full_name
        }
    }

    /// Lowercased first value of the configured email attribute.
    pub fn email(&self, attrs: &AttributeSet) -> Option<String> {
        let snap = self.snapshot;
        let raw = attrs.first_token(snap.settings.headers.email.as_deref()?)?;
        let email = if snap.settings.convert_to_utf8 {
            legacy_utf8_fix(&raw).into_owned()
        } else {
            raw
        };
        Some(email.to_lowercase())
    }

    /// Roles discovered from the attributes, without the defaults.
    /// Channels are visited in sorted order.
    pub fn discovered_roles(&self, attrs: &AttributeSet) -> BTreeSet<String> {
        let pipeline = self.snapshot.group_pipeline();
        let mut roles = BTreeSet::new();
        for channel in self.snapshot.roles.channels() {
            for raw in attrs.get_all(channel) {
                roles.extend(pipeline.expand(channel, raw).into_set());
            }
        }
        roles
    }

    /// Default roles plus discovered roles.
    pub fn desired_roles(&self, attrs: &AttributeSet) -> BTreeSet<String> {
        let mut roles: BTreeSet<String> = self.snapshot.default_roles.iter().cloned().collect();
        roles.extend(self.discovered_roles(attrs));
        roles
    }
}
