//! End-to-end tests: configuration text → resolved identity → reconciled
//! memberships in an in-memory identity store.

use std::collections::BTreeSet;

use shibmap_core::config::build_snapshot;
use shibmap_core::errors::MembershipError;
use shibmap_core::reconcile::memory::FailingCall;
use shibmap_core::reconcile::{MemoryStore, Operation, Reconciler};
use shibmap_core::{AttributeSet, IdentityResolver, PropertySource, Snapshot};

// ===========================================================================
// Helpers
// ===========================================================================

const SCENARIO: &str = "\
default.roles = users
purge.roles = confluence-.*
dynamicroles.header.SHIB-ROLE = staff
dynamicroles.mapper.staff.match = staff:(.+)
dynamicroles.mapper.staff.transform = confluence-$1
";

fn snapshot(text: &str) -> Snapshot {
    let (snapshot, warnings) = build_snapshot(&PropertySource::from_properties_str(text), None);
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
    snapshot
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn principal() -> String {
    "jdoe".to_string()
}

/// Store holding every group in `groups`, with `jdoe` a member of `current`.
fn store_with(groups: &[&str], current: &[&str]) -> MemoryStore {
    let store = MemoryStore::with_groups(groups.iter().copied());
    for role in current {
        store.grant("jdoe", role);
    }
    store
}

// ===========================================================================
// Scenario
// ===========================================================================

#[test]
fn test_scenario_discovery_and_reconciliation() {
    let snapshot = snapshot(SCENARIO);
    let attrs = AttributeSet::from_pairs([("SHIB-ROLE", "staff:eng;staff:ops")]);

    let resolver = IdentityResolver::new(&snapshot);
    assert_eq!(
        resolver.discovered_roles(&attrs),
        set(&["confluence-eng", "confluence-ops"])
    );

    let identity = resolver.resolve(Some("JDoe"), &attrs).unwrap();
    assert_eq!(identity.username, "jdoe");
    assert_eq!(
        identity.desired_roles,
        set(&["confluence-eng", "confluence-ops", "users"])
    );

    let current = set(&["confluence-sales", "users"]);
    let reconciler = Reconciler::new(&snapshot);
    let plan = reconciler.plan(&identity.desired_roles, &current);
    assert_eq!(plan.to_add, set(&["confluence-eng", "confluence-ops"]));
    assert_eq!(plan.to_remove, set(&["confluence-sales"]));

    let store = store_with(
        &["confluence-eng", "confluence-ops", "confluence-sales", "users"],
        &["confluence-sales", "users"],
    );
    let report = reconciler.reconcile(&store, &principal(), &identity.desired_roles);
    assert_eq!(report.added, set(&["confluence-eng", "confluence-ops"]));
    assert_eq!(report.removed, set(&["confluence-sales"]));
    assert!(report.skipped.is_empty());
    assert_eq!(store.roles_of("jdoe"), identity.desired_roles);
}

#[test]
fn test_second_reconciliation_is_noop() {
    let snapshot = snapshot(SCENARIO);
    let desired = set(&["confluence-eng", "users"]);
    let store = store_with(&["confluence-eng", "confluence-sales", "users"], &["confluence-sales"]);
    let reconciler = Reconciler::new(&snapshot);

    let first = reconciler.reconcile(&store, &principal(), &desired);
    assert!(first.changed());
    let mutations = store.mutation_count();

    let second = reconciler.reconcile(&store, &principal(), &desired);
    assert!(!second.changed());
    assert!(second.skipped.is_empty());
    assert_eq!(store.mutation_count(), mutations);

    let current = store.roles_of("jdoe");
    assert!(reconciler.plan(&desired, &current).is_noop());
}

#[test]
fn test_desired_roles_are_never_removed() {
    // Every role is purge-eligible, including the default one.
    let snapshot = snapshot("default.roles = users\npurge.roles = .*\n");
    let desired = set(&["users", "confluence-eng"]);
    let current = set(&["users", "confluence-eng", "confluence-old"]);

    let plan = Reconciler::new(&snapshot).plan(&desired, &current);
    assert_eq!(plan.to_remove, set(&["confluence-old"]));
    assert!(plan.to_remove.is_disjoint(&desired));
    assert_eq!(plan.kept, desired);
}

// ===========================================================================
// Policy
// ===========================================================================

#[test]
fn test_removal_budget_defers_the_rest() {
    let snapshot = snapshot("purge.roles = g-.*\npurge.roles.limit = 1\n");
    let store = store_with(&[], &["g-a", "g-b", "g-c"]);
    let reconciler = Reconciler::new(&snapshot);

    let report = reconciler.reconcile(&store, &principal(), &BTreeSet::new());
    assert_eq!(report.removed, set(&["g-a"]));
    assert_eq!(report.deferred, set(&["g-b", "g-c"]));

    // Later passes work through the backlog.
    reconciler.reconcile(&store, &principal(), &BTreeSet::new());
    reconciler.reconcile(&store, &principal(), &BTreeSet::new());
    assert!(store.roles_of("jdoe").is_empty());
}

#[test]
fn test_missing_group_skipped_without_auto_create() {
    let snapshot = snapshot("");
    let store = store_with(&["exists"], &[]);

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["exists", "missing"]));
    assert_eq!(report.added, set(&["exists"]));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].operation, Operation::Add);
    assert_eq!(
        report.skipped[0].reason,
        MembershipError::GroupNotFound("missing".into())
    );
    assert!(!store.groups().contains("missing"));
}

#[test]
fn test_missing_group_created_with_auto_create() {
    let snapshot = snapshot("dynamicroles.auto_create_role = true\n");
    let store = store_with(&[], &[]);

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["brand-new"]));
    assert_eq!(report.added, set(&["brand-new"]));
    assert!(store.groups().contains("brand-new"));
    assert_eq!(store.roles_of("jdoe"), set(&["brand-new"]));
}

#[test]
fn test_inactive_principal_gains_nothing_but_is_purged() {
    let snapshot = snapshot("purge.roles = old\n");
    let store = store_with(&["new"], &["old"]);
    store.deactivate("jdoe");

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["new"]));
    assert!(report.added.is_empty());
    assert_eq!(report.removed, set(&["old"]));
    assert_eq!(
        report.skipped[0].reason,
        MembershipError::PrincipalInactive("jdoe".into())
    );
    assert!(store.roles_of("jdoe").is_empty());
}

// ===========================================================================
// Failures
// ===========================================================================

#[test]
fn test_injected_failures_are_isolated() {
    let snapshot = snapshot("purge.roles = old-.*\n");
    let store = store_with(&["a", "b", "c"], &["old-1", "old-2"]);
    store.fail_on(FailingCall::ResolveGroup, "a");
    store.fail_on(FailingCall::RemoveMembership, "old-2");

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["a", "b", "c"]));
    assert_eq!(report.added, set(&["b", "c"]));
    assert_eq!(report.removed, set(&["old-1"]));

    let failed: BTreeSet<&str> = report.skipped.iter().map(|s| s.role.as_str()).collect();
    assert_eq!(failed, BTreeSet::from(["a", "old-2"]));
    assert!(report
        .skipped
        .iter()
        .all(|s| matches!(s.reason, MembershipError::MutationFailed { .. })));
}

#[test]
fn test_failed_group_creation_is_skipped() {
    let snapshot = snapshot("dynamicroles.auto_create_role = true\n");
    let store = store_with(&[], &[]);
    store.fail_on(FailingCall::CreateGroup, "doomed");

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["doomed", "fine"]));
    assert_eq!(report.added, set(&["fine"]));
    assert!(matches!(
        report.skipped[0].reason,
        MembershipError::MutationFailed { operation: "create", .. }
    ));
}

#[test]
fn test_add_lost_to_concurrent_login_counts_as_satisfied() {
    let snapshot = snapshot("");
    let store = store_with(&["eng"], &[]);
    store.race_on(FailingCall::AddMembership, "eng");

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["eng"]));
    assert!(report.skipped.is_empty());
    assert!(report.added.is_empty());
    assert_eq!(report.already_satisfied, set(&["eng"]));
    assert_eq!(store.roles_of("jdoe"), set(&["eng"]));
}

#[test]
fn test_remove_lost_to_concurrent_login_counts_as_satisfied() {
    let snapshot = snapshot("purge.roles = old\n");
    let store = store_with(&[], &["old"]);
    store.race_on(FailingCall::RemoveMembership, "old");

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &BTreeSet::new());
    assert!(report.skipped.is_empty());
    assert!(report.removed.is_empty());
    assert_eq!(report.already_satisfied, set(&["old"]));
    assert!(store.roles_of("jdoe").is_empty());
}

#[test]
fn test_group_created_out_of_band_is_picked_up_next_login() {
    let snapshot = snapshot("");
    let store = MemoryStore::new();
    let reconciler = Reconciler::new(&snapshot);

    let first = reconciler.reconcile(&store, &principal(), &set(&["late"]));
    assert_eq!(first.skipped.len(), 1);

    store.add_group("late");
    let second = reconciler.reconcile(&store, &principal(), &set(&["late"]));
    assert!(second.skipped.is_empty());
    assert_eq!(second.added, set(&["late"]));
}

#[test]
fn test_unlistable_current_roles_means_no_removals() {
    let snapshot = snapshot("purge.roles = .*\n");
    let store = store_with(&["keep", "stale"], &["keep", "stale"]);
    store.fail_listing();

    let report = Reconciler::new(&snapshot).reconcile(&store, &principal(), &set(&["keep"]));
    assert!(report.removed.is_empty());
    assert!(report.added.is_empty());
    assert_eq!(report.already_satisfied, set(&["keep"]));
    assert_eq!(store.roles_of("jdoe"), set(&["keep", "stale"]));
}

#[test]
fn test_absent_group_removal_counts_as_done() {
    let snapshot = snapshot("purge.roles = gone\n");
    let reconciler = Reconciler::new(&snapshot);
    let store = MemoryStore::new();

    let plan = reconciler.plan(&BTreeSet::new(), &set(&["gone"]));
    let report = reconciler.apply(&store, &principal(), &plan);
    assert!(report.skipped.is_empty());
    assert_eq!(report.already_satisfied, set(&["gone"]));
}
