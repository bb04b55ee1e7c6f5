//! Membership reconciliation.
//!
//! Reconciliation is split into a pure planning step and a best-effort
//! apply step:
//!
//! ```text
//!   desired ─┐
//!            ├─ plan ─▶ to_add    = desired − current
//!   current ─┘          to_remove = {r ∈ current − desired | a purge rule matches r}
//!                                   (at most removal_budget; the rest deferred)
//!                       kept      = {r ∈ current ∩ desired | a purge rule matches r}
//!
//!   apply: each addition and removal is independent; a failure is recorded
//!          in the report and the batch continues.
//! ```
//!
//! A desired role is never removed. Running the same reconciliation twice is
//! a no-op the second time.

use std::collections::BTreeSet;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::store::IdentityStore;
use crate::errors::{MembershipError, StoreError};
use crate::snapshot::Snapshot;

// ---------------------------------------------------------------------------
// Plan and report
// ---------------------------------------------------------------------------

/// What a reconciliation intends to change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub to_add: BTreeSet<String>,
    pub to_remove: BTreeSet<String>,
    /// Purge candidates left for a later pass because the removal budget
    /// was reached.
    pub deferred: BTreeSet<String>,
    /// Roles a purge rule matched but that are desired, so stay.
    pub kept: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Membership mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Remove,
}

/// One mutation that was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedMutation {
    pub role: String,
    pub operation: Operation,
    #[serde(serialize_with = "serialize_display")]
    pub reason: MembershipError,
}

fn serialize_display<S: Serializer>(value: &MembershipError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

/// What a reconciliation actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    /// Planned mutations the store already reflected.
    pub already_satisfied: BTreeSet<String>,
    pub skipped: Vec<SkippedMutation>,
    pub deferred: BTreeSet<String>,
}

impl ReconcileReport {
    /// Whether any mutation reached the store.
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    fn skip(&mut self, role: &str, operation: Operation, reason: MembershipError) {
        warn!(role, ?operation, reason = %reason, "membership change skipped");
        self.skipped.push(SkippedMutation {
            role: role.to_string(),
            operation,
            reason,
        });
    }
}

/// Result of a single mutation attempt.
enum Applied {
    Changed,
    AlreadySatisfied,
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Reconciles memberships under one snapshot's purge rules, auto-create
/// policy and removal budget.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'s> {
    snapshot: &'s Snapshot,
}

impl<'s> Reconciler<'s> {
    pub fn new(snapshot: &'s Snapshot) -> Self {
        Self { snapshot }
    }

    /// Compute additions and removals. Pure.
    pub fn plan(&self, desired: &BTreeSet<String>, current: &BTreeSet<String>) -> ReconcilePlan {
        let budget = self.snapshot.settings.removal_budget;
        let mut plan = ReconcilePlan {
            to_add: desired.difference(current).cloned().collect(),
            ..ReconcilePlan::default()
        };

        for role in current {
            if !self.snapshot.is_purgeable(role) {
                continue;
            }
            if desired.contains(role) {
                plan.kept.insert(role.clone());
            } else if budget.is_some_and(|limit| plan.to_remove.len() >= limit) {
                plan.deferred.insert(role.clone());
            } else {
                plan.to_remove.insert(role.clone());
            }
        }

        if !plan.deferred.is_empty() {
            warn!(
                budget = ?budget,
                deferred = plan.deferred.len(),
                "removal budget reached, remaining purges deferred"
            );
        }
        debug!(
            add = plan.to_add.len(),
            remove = plan.to_remove.len(),
            kept = plan.kept.len(),
            "reconciliation planned"
        );
        plan
    }

    /// Read the principal's current roles from `store`, plan, and apply.
    ///
    /// If the current roles cannot be listed they are treated as empty: no
    /// removals happen and every desired role is checked individually.
    pub fn reconcile<S: IdentityStore>(
        &self,
        store: &S,
        principal: &S::Principal,
        desired: &BTreeSet<String>,
    ) -> ReconcileReport {
        let current = match store.list_current_role_names(principal) {
            Ok(current) => current,
            Err(e) => {
                warn!(principal = %principal, error = %e, "cannot list current roles, assuming none");
                BTreeSet::new()
            }
        };
        let plan = self.plan(desired, &current);
        self.apply(store, principal, &plan)
    }

    /// Carry out `plan` against `store`. Each mutation stands alone.
    pub fn apply<S: IdentityStore>(
        &self,
        store: &S,
        principal: &S::Principal,
        plan: &ReconcilePlan,
    ) -> ReconcileReport {
        let mut report = ReconcileReport {
            deferred: plan.deferred.clone(),
            ..ReconcileReport::default()
        };

        if !plan.to_add.is_empty() {
            let active = match store.is_active(principal) {
                Ok(active) => active,
                Err(e) => {
                    warn!(principal = %principal, error = %e, "cannot determine whether principal is active");
                    false
                }
            };

            for role in &plan.to_add {
                if !active {
                    report.skip(role, Operation::Add, MembershipError::PrincipalInactive(principal.to_string()));
                    continue;
                }
                match self.add_one(store, principal, role) {
                    Ok(Applied::Changed) => {
                        info!(principal = %principal, role = %role, "membership added");
                        report.added.insert(role.clone());
                    }
                    Ok(Applied::AlreadySatisfied) => {
                        report.already_satisfied.insert(role.clone());
                    }
                    Err(reason) => report.skip(role, Operation::Add, reason),
                }
            }
        }

        for role in &plan.to_remove {
            match self.remove_one(store, principal, role) {
                Ok(Applied::Changed) => {
                    info!(principal = %principal, role = %role, "membership removed");
                    report.removed.insert(role.clone());
                }
                Ok(Applied::AlreadySatisfied) => {
                    report.already_satisfied.insert(role.clone());
                }
                Err(reason) => report.skip(role, Operation::Remove, reason),
            }
        }

        report
    }

    fn add_one<S: IdentityStore>(
        &self,
        store: &S,
        principal: &S::Principal,
        role: &str,
    ) -> Result<Applied, MembershipError> {
        let failed = |operation: &'static str, source: StoreError| MembershipError::MutationFailed {
            operation,
            role: role.to_string(),
            source,
        };

        let group = match store.resolve_group(role) {
            Ok(Some(group)) => group,
            Ok(None) | Err(StoreError::GroupNotFound(_)) => {
                if !self.snapshot.settings.auto_create_group {
                    return Err(MembershipError::GroupNotFound(role.to_string()));
                }
                let group = store.create_group(role).map_err(|e| failed("create", e))?;
                info!(role, "group created");
                group
            }
            Err(e) => return Err(failed("resolve", e)),
        };

        if let Ok(true) = store.is_member(principal, &group) {
            return Ok(Applied::AlreadySatisfied);
        }

        match store.add_membership(principal, &group) {
            Ok(()) => Ok(Applied::Changed),
            // A concurrent login may have added it first.
            Err(_) if matches!(store.is_member(principal, &group), Ok(true)) => Ok(Applied::AlreadySatisfied),
            Err(e) => Err(failed("add", e)),
        }
    }

    fn remove_one<S: IdentityStore>(
        &self,
        store: &S,
        principal: &S::Principal,
        role: &str,
    ) -> Result<Applied, MembershipError> {
        let failed = |operation: &'static str, source: StoreError| MembershipError::MutationFailed {
            operation,
            role: role.to_string(),
            source,
        };

        let group = match store.resolve_group(role) {
            Ok(Some(group)) => group,
            // No group, no membership.
            Ok(None) | Err(StoreError::GroupNotFound(_)) => return Ok(Applied::AlreadySatisfied),
            Err(e) => return Err(failed("resolve", e)),
        };

        if let Ok(false) = store.is_member(principal, &group) {
            return Ok(Applied::AlreadySatisfied);
        }

        match store.remove_membership(principal, &group) {
            Ok(()) => Ok(Applied::Changed),
            Err(_) if matches!(store.is_member(principal, &group), Ok(false)) => Ok(Applied::AlreadySatisfied),
            Err(e) => Err(failed("remove", e)),
        }
    }
}
