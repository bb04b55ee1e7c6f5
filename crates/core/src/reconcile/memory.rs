//! In-memory [`IdentityStore`] for tests and offline evaluation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::store::IdentityStore;
use crate::errors::StoreError;

/// A store operation that can be made to fail on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailingCall {
    ResolveGroup,
    CreateGroup,
    AddMembership,
    RemoveMembership,
}

#[derive(Debug, Default)]
struct Inner {
    groups: BTreeSet<String>,
    members: BTreeMap<String, BTreeSet<String>>,
    inactive: BTreeSet<String>,
    failing: BTreeSet<(FailingCall, String)>,
    racing: BTreeSet<(FailingCall, String)>,
    failing_listing: bool,
    mutations: usize,
}

/// Principals and groups are plain names. All state sits behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store where every name in `groups` exists.
    pub fn with_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let store = Self::new();
        store.lock().groups.extend(groups.into_iter().map(Into::into));
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_group(&self, name: &str) {
        self.lock().groups.insert(name.to_string());
    }

    /// Make `principal` a member of `group`, creating the group if needed.
    pub fn grant(&self, principal: &str, group: &str) {
        let mut inner = self.lock();
        inner.groups.insert(group.to_string());
        inner
            .members
            .entry(principal.to_string())
            .or_default()
            .insert(group.to_string());
    }

    pub fn deactivate(&self, principal: &str) {
        self.lock().inactive.insert(principal.to_string());
    }

    /// Make `call` fail whenever it targets `group`.
    pub fn fail_on(&self, call: FailingCall, group: &str) {
        self.lock().failing.insert((call, group.to_string()));
    }

    /// Make `call` report a failure for `group` after its change has been
    /// applied, as when a concurrent login got there first.
    pub fn race_on(&self, call: FailingCall, group: &str) {
        self.lock().racing.insert((call, group.to_string()));
    }

    /// Make `list_current_role_names` fail.
    pub fn fail_listing(&self) {
        self.lock().failing_listing = true;
    }

    pub fn groups(&self) -> BTreeSet<String> {
        self.lock().groups.clone()
    }

    pub fn roles_of(&self, principal: &str) -> BTreeSet<String> {
        self.lock().members.get(principal).cloned().unwrap_or_default()
    }

    /// Number of successful add/remove/create calls so far.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    fn check(inner: &Inner, call: FailingCall, group: &str) -> Result<(), StoreError> {
        if inner.failing.contains(&(call, group.to_string())) {
            return Err(StoreError::Backend(format!("injected {call:?} failure for '{group}'")));
        }
        Ok(())
    }

    fn raced(inner: &Inner, call: FailingCall, group: &str) -> Result<(), StoreError> {
        if inner.racing.contains(&(call, group.to_string())) {
            return Err(StoreError::Backend(format!("{call:?} for '{group}' raced with another writer")));
        }
        Ok(())
    }
}

impl IdentityStore for MemoryStore {
    type Principal = String;
    type Group = String;

    fn resolve_group(&self, name: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock();
        Self::check(&inner, FailingCall::ResolveGroup, name)?;
        Ok(inner.groups.get(name).cloned())
    }

    fn create_group(&self, name: &str) -> Result<String, StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, FailingCall::CreateGroup, name)?;
        if inner.groups.insert(name.to_string()) {
            inner.mutations += 1;
        }
        Ok(name.to_string())
    }

    fn is_member(&self, principal: &String, group: &String) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .members
            .get(principal)
            .is_some_and(|groups| groups.contains(group)))
    }

    fn add_membership(&self, principal: &String, group: &String) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, FailingCall::AddMembership, group)?;
        if !inner.groups.contains(group) {
            return Err(StoreError::GroupNotFound(group.clone()));
        }
        inner
            .members
            .entry(principal.clone())
            .or_default()
            .insert(group.clone());
        inner.mutations += 1;
        Self::raced(&inner, FailingCall::AddMembership, group)
    }

    fn remove_membership(&self, principal: &String, group: &String) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::check(&inner, FailingCall::RemoveMembership, group)?;
        if let Some(groups) = inner.members.get_mut(principal) {
            groups.remove(group);
        }
        inner.mutations += 1;
        Self::raced(&inner, FailingCall::RemoveMembership, group)
    }

    fn list_current_role_names(&self, principal: &String) -> Result<BTreeSet<String>, StoreError> {
        let inner = self.lock();
        if inner.failing_listing {
            return Err(StoreError::Backend("injected listing failure".into()));
        }
        Ok(inner.members.get(principal).cloned().unwrap_or_default())
    }

    fn is_active(&self, principal: &String) -> Result<bool, StoreError> {
        Ok(!self.lock().inactive.contains(principal))
    }
}
