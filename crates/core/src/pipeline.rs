//! Transformation pipeline: raw attribute value in, candidate outputs out.
//!
//! # Data Flow
//! ```text
//! raw value "staff:eng;staff:ops"
//!     → split on , ;            ["staff:eng", "staff:ops"]
//!     → legacy UTF-8 fix        (when convert.to.utf8)
//!     → every bound rule × every token
//!     → split each rule output on , ;
//!     → lowercase               (group channels, when enabled)
//!     → Candidates              {"confluence-eng", "confluence-ops"}
//! ```
//!
//! An empty result is a normal outcome ("no effect"), never an error.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use regex_lite::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::RuleError;
use crate::registry::RuleRegistry;
use crate::text::{legacy_utf8_fix, split_pairs, split_values};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-channel pipeline switches taken from the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Apply [`legacy_utf8_fix`] to every input token.
    pub convert_to_utf8: bool,
    /// Lowercase every output token.
    pub lowercase_output: bool,
}

/// How a pick-one channel chooses among several candidates.
///
/// The choice is deterministic for a fixed snapshot and input either way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TieBreak {
    /// The first candidate produced, in rule binding order then token order.
    #[default]
    First,
    /// The lexicographically smallest candidate.
    Lexical,
}

impl FromStr for TieBreak {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "lexical" => Ok(Self::Lexical),
            other => Err(format!("unknown tie-break strategy '{other}' (expected first or lexical)")),
        }
    }
}

impl fmt::Display for TieBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Lexical => write!(f, "lexical"),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// Deduplicated pipeline output. Membership is order-insensitive, but
/// insertion order is kept so [`TieBreak::First`] is well defined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    values: Vec<String>,
}

impl Candidates {
    /// Insert a value unless already present. Returns whether it was new.
    pub fn insert(&mut self, value: String) -> bool {
        if self.values.contains(&value) {
            return false;
        }
        self.values.push(value);
        true
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    /// Pick a single value according to `tie_break`.
    pub fn pick(&self, tie_break: TieBreak) -> Option<&str> {
        let chosen = match tie_break {
            TieBreak::First => self.values.first(),
            TieBreak::Lexical => self.values.iter().min(),
        };
        chosen.map(String::as_str)
    }

    pub fn into_set(self) -> BTreeSet<String> {
        self.values.into_iter().collect()
    }
}

impl Extend<String> for Candidates {
    fn extend<T: IntoIterator<Item = String>>(&mut self, iter: T) {
        for value in iter {
            self.insert(value);
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Runs the rules of one registry over raw values.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<'a> {
    registry: &'a RuleRegistry,
    options: PipelineOptions,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a RuleRegistry, options: PipelineOptions) -> Self {
        Self { registry, options }
    }

    /// Expand one raw value through every rule bound to `channel`.
    pub fn expand(&self, channel: &str, raw: &str) -> Candidates {
        let mut out = Candidates::default();
        self.expand_into(channel, raw, &mut out);
        out
    }

    /// Like [`expand`](Self::expand), accumulating into an existing set.
    pub fn expand_into(&self, channel: &str, raw: &str, out: &mut Candidates) {
        let rules = self.registry.rules_for(channel);
        if rules.is_empty() {
            return;
        }

        let tokens: Vec<String> = split_values(raw)
            .into_iter()
            .map(|token| {
                if self.options.convert_to_utf8 {
                    legacy_utf8_fix(&token).into_owned()
                } else {
                    token
                }
            })
            .collect();

        for rule in rules {
            for token in &tokens {
                let Some(output) = rule.process(token) else {
                    continue;
                };
                for value in split_values(&output) {
                    let value = if self.options.lowercase_output {
                        value.to_lowercase()
                    } else {
                        value
                    };
                    out.insert(value);
                }
            }
        }

        debug!(channel, raw, produced = out.len(), "expanded value");
    }

    /// Expand `raw` and reduce the result to one value.
    ///
    /// Returns `None` when nothing matched; the caller supplies the fallback.
    /// When several candidates remain, one is chosen with `tie_break` and the
    /// ambiguity is logged.
    pub fn pick(&self, channel: &str, raw: &str, tie_break: TieBreak) -> Option<String> {
        let candidates = self.expand(channel, raw);
        let chosen = candidates.pick(tie_break)?.to_string();

        if candidates.len() > 1 {
            warn!(
                channel,
                raw,
                candidates = ?candidates.iter().collect::<Vec<_>>(),
                chosen = %chosen,
                strategy = %tie_break,
                "ambiguous mapping, several candidates produced"
            );
        }
        Some(chosen)
    }
}

// ---------------------------------------------------------------------------
// Literal replacement lists
// ---------------------------------------------------------------------------

/// One `pattern → literal` substitution applied after a pick-one channel.
#[derive(Debug, Clone)]
struct Replacement {
    pattern: Regex,
    replacement: String,
}

/// An ordered list of regex → literal substitutions (`remoteuser.replace`,
/// `fullname.replace`). Every occurrence of each pattern is replaced, in
/// list order.
#[derive(Debug, Clone, Default)]
pub struct ReplacementList {
    entries: Vec<Replacement>,
}

impl ReplacementList {
    /// Parse a flat `pattern, replacement, ...` list read from `key`.
    /// Invalid patterns and a dangling final pattern are reported and
    /// skipped.
    pub fn parse(key: &str, raw: &str) -> (Self, Vec<RuleError>) {
        let (pairs, dangling) = split_pairs(raw);
        let mut errors = Vec::new();

        if dangling.is_some() {
            errors.push(RuleError::OddReplacementList {
                key: key.to_string(),
                count: pairs.len() * 2 + 1,
            });
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for (index, (pattern, replacement)) in pairs.into_iter().enumerate() {
            if pattern.is_empty() {
                continue;
            }
            match Regex::new(&pattern) {
                Ok(regex) => entries.push(Replacement {
                    pattern: regex,
                    replacement,
                }),
                Err(e) => errors.push(RuleError::Compile {
                    label: format!("{key}[{index}]"),
                    pattern,
                    detail: e.to_string(),
                }),
            }
        }

        (Self { entries }, errors)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn apply(&self, value: &str) -> String {
        self.entries.iter().fold(value.to_string(), |acc, entry| {
            entry
                .pattern
                .replace_all(&acc, NoExpand(&entry.replacement))
                .into_owned()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleSpec;

    fn registry(rules: &[(&str, Option<&str>, Option<&str>)]) -> RuleRegistry {
        let mut b = RuleRegistry::builder();
        for (label, m, t) in rules {
            b.define_and_bind("shib-role", RuleSpec::new(*label, *m, *t, true));
        }
        let (reg, errors) = b.build();
        assert!(errors.is_empty());
        reg
    }

    const GROUPS: PipelineOptions = PipelineOptions {
        convert_to_utf8: false,
        lowercase_output: true,
    };

    #[test]
    fn test_expand_end_to_end_example() {
        let reg = registry(&[("staff", Some("staff:(.+)"), Some("confluence-$1"))]);
        let out = Pipeline::new(&reg, GROUPS).expand("SHIB-ROLE", "staff:eng;staff:ops");
        let set = out.into_set();
        assert_eq!(
            set,
            BTreeSet::from(["confluence-eng".to_string(), "confluence-ops".to_string()])
        );
    }

    #[test]
    fn test_multi_valued_splitting() {
        let reg = registry(&[("all", None, None)]);
        let out = Pipeline::new(&reg, GROUPS).expand("shib-role", "a, b;c;;");
        assert_eq!(out.iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rule_output_split_and_deduplicated() {
        let reg = registry(&[
            ("pair", Some("(\\w+)\\+(\\w+)"), Some("$1; $2")),
            ("whole", Some("(\\w+)\\+.*"), Some("$1")),
        ]);
        let out = Pipeline::new(&reg, GROUPS).expand("shib-role", "eng+ops");
        assert_eq!(out.iter().collect::<Vec<_>>(), vec!["eng", "ops"]);
    }

    #[test]
    fn test_rules_see_original_case_then_lowercase() {
        let reg = registry(&[("upper", Some("STAFF:(.+)"), Some("Grp-$1"))]);
        let lower = Pipeline::new(&reg, GROUPS).expand("shib-role", "STAFF:Eng");
        assert_eq!(lower.iter().collect::<Vec<_>>(), vec!["grp-eng"]);

        let keep = Pipeline::new(&reg, PipelineOptions::default()).expand("shib-role", "STAFF:Eng");
        assert_eq!(keep.iter().collect::<Vec<_>>(), vec!["Grp-Eng"]);
    }

    #[test]
    fn test_empty_and_unbound_inputs() {
        let reg = registry(&[("all", None, None)]);
        let p = Pipeline::new(&reg, GROUPS);
        assert!(p.expand("shib-role", "").is_empty());
        assert!(p.expand("shib-role", " ; ").is_empty());
        assert!(p.expand("unknown-header", "value").is_empty());
    }

    #[test]
    fn test_utf8_fix_applied_to_tokens() {
        let reg = registry(&[("all", None, None)]);
        let mangled: String = "José".bytes().map(char::from).collect();
        let opts = PipelineOptions {
            convert_to_utf8: true,
            lowercase_output: false,
        };
        let out = Pipeline::new(&reg, opts).expand("shib-role", &mangled);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec!["José"]);
    }

    #[test]
    fn test_pick_tie_break() {
        let reg = registry(&[
            ("b", Some("x"), Some("bravo")),
            ("a", Some("x"), Some("alpha")),
        ]);
        let p = Pipeline::new(&reg, PipelineOptions::default());
        assert_eq!(p.pick("shib-role", "x", TieBreak::First).as_deref(), Some("bravo"));
        assert_eq!(p.pick("shib-role", "x", TieBreak::Lexical).as_deref(), Some("alpha"));
        assert_eq!(p.pick("shib-role", "y", TieBreak::First), None);
    }

    #[test]
    fn test_tie_break_parse() {
        assert_eq!("First".parse::<TieBreak>().unwrap(), TieBreak::First);
        assert_eq!("lexical".parse::<TieBreak>().unwrap(), TieBreak::Lexical);
        assert!("shortest".parse::<TieBreak>().is_err());
    }

    #[test]
    fn test_replacement_list() {
        let (list, errors) = ReplacementList::parse("remoteuser.replace", "@.*,, [^a-z0-9]+,_");
        assert!(errors.is_empty());
        assert_eq!(list.len(), 2);
        assert_eq!(list.apply("j.doe@example.org"), "j_doe");
    }

    #[test]
    fn test_replacement_is_literal() {
        let (list, _) = ReplacementList::parse("k", "(a),$1");
        assert_eq!(list.apply("banana"), "b$1n$1n$1");
    }

    #[test]
    fn test_replacement_list_errors() {
        let (list, errors) = ReplacementList::parse("k", "(bad,x,ok,y,dangling");
        assert_eq!(list.len(), 1);
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| matches!(e, RuleError::OddReplacementList { count: 5, .. })));
        assert!(errors.iter().any(|e| matches!(e, RuleError::Compile { .. })));
    }
}
