//! Rule registry: named input channels bound to ordered lists of rules.
//!
//! A channel is an attribute/header name (`shib-ep-entitlement`) or a fixed
//! logical slot (`username`, `fullname`, `purge`). Channel names and rule
//! labels are case-folded. A rule referenced from several channels is
//! compiled once and shared.
//!
//! Registries are built once per configuration snapshot and never mutated.
//! When a previous registry is supplied, rules whose definition did not
//! change are reused instead of recompiled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use crate::errors::RuleError;
use crate::rule::{Rule, RuleSpec};

/// Logical channel for username sanitization rules.
pub const USERNAME_CHANNEL: &str = "username";
/// Logical channel for display-name formatting rules.
pub const FULLNAME_CHANNEL: &str = "fullname";
/// Logical channel for purge-eligibility rules.
pub const PURGE_CHANNEL: &str = "purge";

/// Case-fold a channel name or rule label.
pub fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// An immutable set of compiled rules and the channels they are bound to.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: BTreeMap<String, Arc<Rule>>,
    bindings: BTreeMap<String, Vec<Arc<Rule>>>,
}

impl RuleRegistry {
    pub fn builder<'p>() -> RegistryBuilder<'p> {
        RegistryBuilder::default()
    }

    /// Rules bound to `channel`, in binding order. Unknown channels yield
    /// nothing.
    pub fn rules_for(&self, channel: &str) -> &[Arc<Rule>] {
        self.bindings
            .get(&fold(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether any rule is bound to `channel`.
    pub fn is_bound(&self, channel: &str) -> bool {
        !self.rules_for(channel).is_empty()
    }

    /// Bound channel names, sorted.
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }

    /// Look up a compiled rule by label.
    pub fn rule(&self, label: &str) -> Option<&Arc<Rule>> {
        self.rules.get(&fold(label))
    }

    /// Number of distinct compiled rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Collects rule definitions and channel bindings, then compiles them into a
/// [`RuleRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder<'p> {
    specs: BTreeMap<String, RuleSpec>,
    bindings: BTreeMap<String, Vec<String>>,
    previous: Option<&'p RuleRegistry>,
}

impl<'p> RegistryBuilder<'p> {
    /// Reuse compiled rules from `previous` when their definition is
    /// unchanged.
    pub fn reuse_from(mut self, previous: &'p RuleRegistry) -> Self {
        self.previous = Some(previous);
        self
    }

    /// Add (or replace) a rule definition. The label is case-folded.
    pub fn define(&mut self, mut spec: RuleSpec) -> &mut Self {
        spec.label = fold(&spec.label);
        self.specs.insert(spec.label.clone(), spec);
        self
    }

    /// Whether a rule with this label has already been defined.
    pub fn is_defined(&self, label: &str) -> bool {
        self.specs.contains_key(&fold(label))
    }

    /// Append `labels` to the rules bound to `channel`. Repeated labels are
    /// bound only once, at their first position.
    pub fn bind<I, S>(&mut self, channel: &str, labels: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let bound = self.bindings.entry(fold(channel)).or_default();
        for label in labels {
            let label = fold(label.as_ref());
            if !label.is_empty() && !bound.contains(&label) {
                bound.push(label);
            }
        }
        self
    }

    /// Define a rule and bind it to `channel` in one step.
    pub fn define_and_bind(&mut self, channel: &str, spec: RuleSpec) -> &mut Self {
        let label = fold(&spec.label);
        self.define(spec);
        self.bind(channel, [label])
    }

    /// Compile every referenced rule.
    ///
    /// Only rules that are bound to at least one channel are compiled. A rule
    /// that fails to compile, or a label with no definition, is left out and
    /// reported; everything else still loads.
    pub fn build(self) -> (RuleRegistry, Vec<RuleError>) {
        let mut errors = Vec::new();
        let mut rules: BTreeMap<String, Arc<Rule>> = BTreeMap::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        let mut bindings: BTreeMap<String, Vec<Arc<Rule>>> = BTreeMap::new();

        for (channel, labels) in &self.bindings {
            let mut bound = Vec::with_capacity(labels.len());

            for label in labels {
                if let Some(rule) = rules.get(label) {
                    bound.push(Arc::clone(rule));
                    continue;
                }
                if failed.contains(label) {
                    continue;
                }

                let Some(spec) = self.specs.get(label) else {
                    errors.push(RuleError::UnknownLabel {
                        channel: channel.clone(),
                        label: label.clone(),
                    });
                    continue;
                };

                match self.compile(spec) {
                    Ok(rule) => {
                        rules.insert(label.clone(), Arc::clone(&rule));
                        bound.push(rule);
                    }
                    Err(e) => {
                        failed.insert(label.clone());
                        errors.push(e);
                    }
                }
            }

            if !bound.is_empty() {
                bindings.insert(channel.clone(), bound);
            }
        }

        (RuleRegistry { rules, bindings }, errors)
    }

    fn compile(&self, spec: &RuleSpec) -> Result<Arc<Rule>, RuleError> {
        if let Some(existing) = self
            .previous
            .and_then(|prev| prev.rules.get(&spec.label))
            .filter(|rule| rule.spec() == spec)
        {
            trace!(label = %spec.label, "reusing compiled rule from previous snapshot");
            return Ok(Arc::clone(existing));
        }
        Rule::new(spec.clone()).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(label: &str, m: Option<&str>, t: Option<&str>) -> RuleSpec {
        RuleSpec::new(label, m, t, true)
    }

    #[test]
    fn test_shared_rule_compiled_once() {
        let mut b = RuleRegistry::builder();
        b.define(spec("staff", Some("staff:(.+)"), Some("grp-$1")));
        b.bind("SHIB-ROLE", ["staff"]);
        b.bind("shib-entitlement", ["STAFF"]);
        let (reg, errors) = b.build();

        assert!(errors.is_empty());
        assert_eq!(reg.len(), 1);
        let a = &reg.rules_for("shib-role")[0];
        let b = &reg.rules_for("Shib-Entitlement")[0];
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn test_bindings_are_distinct_and_ordered() {
        let mut b = RuleRegistry::builder();
        b.define(spec("one", None, Some("1")));
        b.define(spec("two", None, Some("2")));
        b.bind("h", ["two", "one", "two"]);
        b.bind("h", ["one"]);
        let (reg, _) = b.build();

        let labels: Vec<&str> = reg.rules_for("h").iter().map(|r| r.label()).collect();
        assert_eq!(labels, vec!["two", "one"]);
    }

    #[test]
    fn test_bad_rule_dropped_rest_loads() {
        let mut b = RuleRegistry::builder();
        b.define(spec("bad", Some("(oops"), None));
        b.define(spec("good", Some("ok"), None));
        b.bind("h", ["bad", "good", "missing"]);
        b.bind("other", ["bad"]);
        let (reg, errors) = b.build();

        assert_eq!(reg.rules_for("h").len(), 1);
        assert_eq!(reg.rules_for("h")[0].label(), "good");
        assert!(!reg.is_bound("other"));
        // One compile error (not repeated for the second channel) and one
        // unknown label.
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| matches!(e, RuleError::Compile { .. })));
        assert!(errors
            .iter()
            .any(|e| matches!(e, RuleError::UnknownLabel { label, .. } if label == "missing")));
    }

    #[test]
    fn test_unbound_definitions_not_compiled() {
        let mut b = RuleRegistry::builder();
        b.define(spec("bad", Some("(oops"), None));
        let (reg, errors) = b.build();
        assert!(reg.is_empty());
        assert!(errors.is_empty());
    }

    #[test]
    fn test_reuse_unchanged_rules() {
        let mut b = RuleRegistry::builder();
        b.define(spec("keep", Some("a"), None));
        b.define(spec("change", Some("b"), None));
        b.bind("h", ["keep", "change"]);
        let (old, _) = b.build();

        let mut b = RuleRegistry::builder().reuse_from(&old);
        b.define(spec("keep", Some("a"), None));
        b.define(spec("change", Some("c"), None));
        b.bind("h", ["keep", "change"]);
        let (new, _) = b.build();

        assert!(Arc::ptr_eq(old.rule("keep").unwrap(), new.rule("keep").unwrap()));
        assert!(!Arc::ptr_eq(old.rule("change").unwrap(), new.rule("change").unwrap()));
        assert!(new.rule("change").unwrap().is_match("c"));
    }

    #[test]
    fn test_channels_sorted() {
        let mut b = RuleRegistry::builder();
        b.define_and_bind("zeta", spec("z", None, None));
        b.define_and_bind("Alpha", spec("a", None, None));
        let (reg, _) = b.build();
        assert_eq!(reg.channels().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
    }
}
