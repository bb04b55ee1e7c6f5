//! Per-request attribute values, keyed case-insensitively.

use std::collections::BTreeMap;

use crate::registry::fold;
use crate::text::split_values;

/// The attributes (HTTP headers or SAML attributes) asserted for one
/// request. Names are case-folded; a name may carry several raw values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
    values: BTreeMap<String, Vec<String>>,
}

impl AttributeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut set = Self::new();
        for (name, value) in pairs {
            set.insert(name.as_ref(), value);
        }
        set
    }

    /// Add one raw value for `name`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        let name = fold(name);
        if name.is_empty() {
            return;
        }
        self.values.entry(name).or_default().push(value.into());
    }

    /// Every raw value recorded for `name`.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.values
            .get(&fold(name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First non-empty token of the first value of `name`, splitting the
    /// value on the usual multi-value separators.
    pub fn first_token(&self, name: &str) -> Option<String> {
        self.get_all(name)
            .iter()
            .find_map(|raw| split_values(raw).into_iter().next())
    }

    /// Attribute names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_case_insensitive() {
        let attrs = AttributeSet::from_pairs([("Shib-Role", "staff:eng"), ("SHIB-ROLE", "staff:ops")]);
        assert_eq!(attrs.get_all("shib-role"), ["staff:eng", "staff:ops"]);
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["shib-role"]);
        assert!(attrs.get_all("mail").is_empty());
    }

    #[test]
    fn test_first_token() {
        let attrs = AttributeSet::from_pairs([("mail", " ; jdoe@example.org; j.doe@example.org")]);
        assert_eq!(attrs.first_token("MAIL").as_deref(), Some("jdoe@example.org"));
        assert_eq!(attrs.first_token("cn"), None);
    }
}
