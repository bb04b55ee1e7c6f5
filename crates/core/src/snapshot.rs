//! The immutable configuration snapshot.
//!
//! A [`Snapshot`] holds everything one login needs: the four rule
//! registries, default roles, flags and literal replacement lists. It is
//! never modified after construction. The reload supervisor replaces it
//! wholesale, and callers keep the `Arc<Snapshot>` they obtained for the
//! duration of a request.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Settings;
use crate::pipeline::{Pipeline, PipelineOptions, ReplacementList};
use crate::registry::{RuleRegistry, PURGE_CHANNEL};

/// Where a snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Backing file, if the snapshot was loaded from one.
    pub path: Option<PathBuf>,
    /// Modification time of the backing file when it was read.
    pub last_modified: Option<SystemTime>,
    /// When the snapshot was built.
    pub loaded_at: DateTime<Utc>,
    /// Increments on every successful reload; the first snapshot is 0.
    pub generation: u64,
}

impl Default for Provenance {
    fn default() -> Self {
        Self {
            path: None,
            last_modified: None,
            loaded_at: Utc::now(),
            generation: 0,
        }
    }
}

/// One immutable configuration state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub settings: Settings,
    /// Roles every principal is granted. Never purged.
    pub default_roles: Vec<String>,
    /// Group-discovery rules, bound to attribute channels.
    pub roles: RuleRegistry,
    /// Purge-eligibility rules, bound to the `purge` channel.
    pub purge: RuleRegistry,
    /// Username sanitization rules, bound to the `username` channel.
    pub username: RuleRegistry,
    /// Display-name rules, bound to the `fullname` channel.
    pub fullname: RuleRegistry,
    pub username_replace: ReplacementList,
    pub fullname_replace: ReplacementList,
    pub provenance: Provenance,
}

impl Snapshot {
    /// Empty configuration: no rules, no default roles, default flags.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pipeline over the group-discovery channels.
    pub fn group_pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(
            &self.roles,
            PipelineOptions {
                convert_to_utf8: self.settings.convert_to_utf8,
                lowercase_output: self.settings.output_lowercase,
            },
        )
    }

    /// Options for the pick-one channels. Their case is handled by
    /// `username.convertcase`, not by the group lowercasing flag.
    pub fn name_options(&self) -> PipelineOptions {
        PipelineOptions {
            convert_to_utf8: self.settings.convert_to_utf8,
            lowercase_output: false,
        }
    }

    /// Whether any purge rule matches `role`.
    pub fn is_purgeable(&self, role: &str) -> bool {
        self.purge
            .rules_for(PURGE_CHANNEL)
            .iter()
            .any(|rule| rule.process(role).is_some())
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            path: self
                .provenance
                .path
                .as_ref()
                .map(|p| p.display().to_string()),
            generation: self.provenance.generation,
            loaded_at: self.provenance.loaded_at,
            default_roles: self.default_roles.clone(),
            group_channels: self.roles.channels().map(str::to_string).collect(),
            group_rules: self.roles.len(),
            purge_rules: self.purge.len(),
            username_rules: self.username.len(),
            fullname_rules: self.fullname.len(),
            username_replacements: self.username_replace.len(),
            fullname_replacements: self.fullname_replace.len(),
            settings: self.settings.clone(),
        }
    }
}

/// Serializable overview of a snapshot, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub path: Option<String>,
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
    pub default_roles: Vec<String>,
    pub group_channels: Vec<String>,
    pub group_rules: usize,
    pub purge_rules: usize,
    pub username_rules: usize,
    pub fullname_rules: usize,
    pub username_replacements: usize,
    pub fullname_replacements: usize,
    pub settings: Settings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleSpec;

    #[test]
    fn test_empty_snapshot() {
        let snap = Snapshot::empty();
        assert!(snap.default_roles.is_empty());
        assert!(snap.roles.is_empty());
        assert!(!snap.is_purgeable("anything"));
        assert_eq!(snap.provenance.generation, 0);
    }

    #[test]
    fn test_is_purgeable() {
        let mut b = RuleRegistry::builder();
        b.define_and_bind(PURGE_CHANNEL, RuleSpec::new("purge-0", Some("confluence-.*"), None, true));
        let (purge, _) = b.build();
        let snap = Snapshot {
            purge,
            ..Snapshot::empty()
        };

        assert!(snap.is_purgeable("confluence-sales"));
        assert!(!snap.is_purgeable("users"));
        assert!(!snap.is_purgeable("Confluence-sales"));
    }

    #[test]
    fn test_summary() {
        let snap = Snapshot {
            default_roles: vec!["users".into()],
            ..Snapshot::empty()
        };
        let summary = snap.summary();
        assert_eq!(summary.default_roles, vec!["users"]);
        assert_eq!(summary.group_rules, 0);
        assert!(summary.path.is_none());
    }
}
