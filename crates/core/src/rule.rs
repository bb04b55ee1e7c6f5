//! A single declarative match/transform rule.
//!
//! A [`Rule`] converts one raw attribute value into zero or one output
//! string:
//!
//! | `match`  | `transform` | Result for input `v`                          |
//! |----------|-------------|-----------------------------------------------|
//! | absent   | absent      | `v` (or nothing when `v` is empty)            |
//! | absent   | `T`         | `T` with `$0` expanded to `v`                 |
//! | `P`      | absent      | `v` if `P` matches all of `v`                 |
//! | `P`      | `T`         | `T` with `$N` expanded from `P`'s captures    |
//!
//! Matching is anchored: the pattern must cover the whole input. The output
//! may itself contain commas or semicolons; splitting it into separate values
//! is the pipeline's job.

use regex_lite::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::RuleError;

/// Pattern used when a rule has no `match`.
const MATCH_ANYTHING: &str = ".*";

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// The uncompiled definition of a rule, as read from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Stable identity of the rule; channels reference rules by label.
    pub label: String,
    /// Regular expression the whole input must match. `None` matches anything.
    pub match_pattern: Option<String>,
    /// Output template with `$0..$N` placeholders. `None` passes the input
    /// through unchanged.
    pub transform: Option<String>,
    /// When false the pattern is compiled case-insensitively.
    pub case_sensitive: bool,
}

impl RuleSpec {
    /// Build a definition. Blank `match_pattern`/`transform` strings are
    /// treated as absent.
    pub fn new(
        label: impl Into<String>,
        match_pattern: Option<&str>,
        transform: Option<&str>,
        case_sensitive: bool,
    ) -> Self {
        Self {
            label: label.into(),
            match_pattern: non_blank(match_pattern),
            transform: non_blank(transform),
            case_sensitive,
        }
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty()).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Compiled rule
// ---------------------------------------------------------------------------

/// A compiled, immutable rule. Cheap to share behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Rule {
    spec: RuleSpec,
    regex: Regex,
}

impl Rule {
    /// Compile a rule definition. Fails only when the match pattern is not a
    /// valid regular expression.
    pub fn new(spec: RuleSpec) -> Result<Self, RuleError> {
        let pattern = spec.match_pattern.as_deref().unwrap_or(MATCH_ANYTHING);
        let anchored = format!("^(?:{pattern})$");

        let regex = RegexBuilder::new(&anchored)
            .case_insensitive(!spec.case_sensitive)
            .build()
            .map_err(|e| RuleError::Compile {
                label: spec.label.clone(),
                pattern: pattern.to_string(),
                detail: e.to_string(),
            })?;

        Ok(Self { spec, regex })
    }

    /// Shorthand for `Rule::new(RuleSpec::new(..))`.
    pub fn compile(
        label: impl Into<String>,
        match_pattern: Option<&str>,
        transform: Option<&str>,
        case_sensitive: bool,
    ) -> Result<Self, RuleError> {
        Self::new(RuleSpec::new(label, match_pattern, transform, case_sensitive))
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    /// Whether `input` is fully matched by this rule's pattern.
    pub fn is_match(&self, input: &str) -> bool {
        self.regex.is_match(input)
    }

    /// Apply the rule to one raw value.
    ///
    /// Returns `None` when the value does not match, or when the value is
    /// empty and the rule has neither a pattern nor a template.
    pub fn process(&self, input: &str) -> Option<String> {
        if input.is_empty() && self.spec.match_pattern.is_none() && self.spec.transform.is_none() {
            return None;
        }

        let Some(caps) = self.regex.captures(input) else {
            debug!(
                rule = %self.spec.label,
                pattern = self.spec.match_pattern.as_deref().unwrap_or(MATCH_ANYTHING),
                value = input,
                "pattern did not match"
            );
            return None;
        };

        let output = match &self.spec.transform {
            Some(template) => expand_template(template, &caps),
            None => input.to_string(),
        };

        debug!(rule = %self.spec.label, value = input, output = %output, "rule matched");
        Some(output)
    }
}

/// Expand `$N` placeholders in `template` from `caps`.
///
/// A placeholder is a `$` followed by the longest run of digits, so `$10` is
/// always group ten and never group one followed by `0`. `$0` never takes
/// further digits: `$01` is the whole match followed by `1`. Indices beyond the
/// pattern's group count are left in the output literally; groups that did
/// not participate in the match expand to the empty string. The template is
/// scanned once, so captured text is never itself re-expanded.
fn expand_template(template: &str, caps: &Captures<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = match after.as_bytes().first() {
            Some(b'0') => 1,
            _ => after.bytes().take_while(u8::is_ascii_digit).count(),
        };

        if digits == 0 {
            out.push('$');
        } else {
            let index = after[..digits].parse::<usize>().ok().filter(|&i| i < caps.len());
            match index {
                Some(i) => out.push_str(caps.get(i).map_or("", |m| m.as_str())),
                None => out.push_str(&rest[pos..=pos + digits]),
            }
        }
        rest = &after[digits..];
    }

    out.push_str(rest);
    out
}
