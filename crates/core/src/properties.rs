//! Flat key/value configuration source.
//!
//! Every configuration front end is reduced to a single ordered map of
//! dotted keys to string values before any rule is built. Two syntaxes are
//! accepted:
//!
//! - Java `.properties` (the format deployed next to most Shibboleth SPs),
//! - TOML, whose nested tables are flattened to dotted keys.
//!
//! ```text
//! [dynamicroles.mapper.staff]        dynamicroles.mapper.staff.match = staff:(.+)
//! match = "staff:(.+)"          →    dynamicroles.mapper.staff.transform = confluence-$1
//! transform = "confluence-$1"
//! ```
//!
//! TOML cannot give a key both a value and sub-keys, so an entry named `_`
//! stands for the enclosing table itself (`[purge.roles] _ = "x"` and
//! `limit = 5` give `purge.roles` and `purge.roles.limit`).

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::text::parse_bool;

/// An ordered, immutable-after-load map of configuration keys to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySource {
    entries: BTreeMap<String, String>,
}

impl PropertySource {
    /// Load a configuration file, choosing the syntax from its extension:
    /// `.toml` is parsed as TOML, anything else as Java properties.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

        let source = if is_toml {
            parse_toml(&contents, &path.display().to_string())?
        } else {
            Self::from_properties_str(&contents)
        };

        debug!(keys = source.len(), "configuration parsed successfully");
        Ok(source)
    }

    /// Parse Java `.properties` text. This syntax has no failure mode: every
    /// line is either a comment, blank, or a key with an (optionally empty)
    /// value.
    pub fn from_properties_str(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in logical_lines(text) {
            let (key, value) = split_key_value(&line);
            if !key.is_empty() {
                entries.insert(key, value);
            }
        }
        Self { entries }
    }

    /// Parse TOML text and flatten it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        parse_toml(text, "<inline>")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw value for `key`, trimmed. Blank values count as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Boolean value for `key`. An unparsable value is reported and the
    /// default used.
    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                detail: format!("'{raw}' is not a boolean, using {default}"),
            }),
        }
    }

    /// Unsigned integer value for `key`.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key)
            .map(|raw| {
                raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    detail: format!("'{raw}': {e}"),
                })
            })
            .transpose()
    }

    /// Every entry whose key starts with `prefix`, yielded as
    /// `(rest_of_key, value)` in key order. Keys are case-sensitive here as
    /// in [`get`](Self::get); only the remainder (a channel or rule label)
    /// is case-folded later.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map_while(move |(key, value)| {
                key.strip_prefix(prefix).map(|rest| (rest, value.as_str()))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PropertySource {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// .properties syntax
// ---------------------------------------------------------------------------

/// Join continuation lines and drop blanks and comments.
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Option<String> = None;

    for raw in text.lines() {
        let trimmed = raw.trim_start();
        let line = match current.take() {
            Some(mut pending) => {
                pending.push_str(trimmed);
                pending
            }
            None => {
                if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                    continue;
                }
                trimmed.to_string()
            }
        };

        if ends_with_continuation(&line) {
            let mut line = line;
            line.pop();
            current = Some(line);
        } else {
            lines.push(line);
        }
    }

    if let Some(pending) = current {
        lines.push(pending);
    }
    lines
}

/// A line continues when it ends in an odd number of backslashes.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Split one logical line at the first unescaped `=`, `:` or whitespace.
fn split_key_value(line: &str) -> (String, String) {
    let mut key_end = line.len();
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => {
                key_end = i;
                break;
            }
            c if c.is_whitespace() => {
                key_end = i;
                break;
            }
            _ => {}
        }
    }

    let key = unescape(&line[..key_end]);
    if key_end == line.len() {
        return (key, String::new());
    }

    // Separator: optional whitespace, at most one '=' or ':', more whitespace.
    let mut rest = line[key_end..].trim_start();
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start();
    }
    (key, unescape(rest))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => {
                        warn!(escape = %hex, "malformed \\u escape in configuration, kept literally");
                        out.push_str("\\u");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

// ---------------------------------------------------------------------------
// TOML syntax
// ---------------------------------------------------------------------------

/// A table entry named `_` sets the table's own key, so TOML can express
/// both `remoteuser` and `remoteuser.replace`.
const SELF_KEY: &str = "_";

fn parse_toml(text: &str, origin: &str) -> Result<PropertySource, ConfigError> {
    let table = text
        .parse::<toml::Table>()
        .map_err(|e| ConfigError::ParseError {
            path: origin.to_string(),
            detail: e.to_string(),
        })?;

    let mut entries = BTreeMap::new();
    flatten_table("", &table, &mut entries);
    Ok(PropertySource { entries })
}

fn flatten_table(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let full = if key == SELF_KEY {
            prefix.to_string()
        } else if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        flatten_value(full, value, out);
    }
}

fn flatten_value(key: String, value: &toml::Value, out: &mut BTreeMap<String, String>) {
    match value {
        toml::Value::Table(table) => flatten_table(&key, table, out),
        toml::Value::Array(items) => {
            let mut scalars = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                match item {
                    toml::Value::Table(table) => flatten_table(&format!("{key}.{i}"), table, out),
                    other => scalars.push(scalar_to_string(other)),
                }
            }
            if !scalars.is_empty() {
                out.insert(key, scalars.join(","));
            }
        }
        scalar => {
            out.insert(key, scalar_to_string(scalar));
        }
    }
}

fn scalar_to_string(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(items) => items.iter().map(scalar_to_string).collect::<Vec<_>>().join(","),
        toml::Value::Table(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_properties_basic_syntax() {
        let src = PropertySource::from_properties_str(
            "# comment\n\
             ! also a comment\n\
             \n\
             default.roles = users, staff\n\
             purge.roles:confluence-.*\n\
             create.users true\n\
             empty.value=\n",
        );
        assert_eq!(src.get("default.roles"), Some("users, staff"));
        assert_eq!(src.get("purge.roles"), Some("confluence-.*"));
        assert_eq!(src.get("create.users"), Some("true"));
        assert_eq!(src.get("empty.value"), None);
        assert_eq!(src.len(), 4);
    }

    #[test]
    fn test_properties_continuation_and_escapes() {
        let src = PropertySource::from_properties_str(
            "dynamicroles.header.SHIB-ROLE = staff, \\\n    faculty\n\
             odd\\=key = a\\tb\n\
             unicode = Jos\\u00e9\n\
             regex = staff\\\\:(.+)\n",
        );
        assert_eq!(src.get("dynamicroles.header.SHIB-ROLE"), Some("staff, faculty"));
        assert_eq!(src.get("odd=key"), Some("a\tb"));
        assert_eq!(src.get("unicode"), Some("José"));
        assert_eq!(src.get("regex"), Some("staff\\:(.+)"));
    }

    #[test]
    fn test_toml_flattening() {
        let src = PropertySource::from_toml_str(
            r#"
            default.roles = ["users", "staff"]

            [dynamicroles]
            auto_create_role = true

            [dynamicroles.header]
            SHIB-ROLE = "staff"

            [dynamicroles.mapper.staff]
            match = "staff:(.+)"
            transform = "confluence-$1"
            casesensitive = false

            [reload.config]
            _ = true
            check.interval = 2500
            "#,
        )
        .unwrap();

        assert_eq!(src.get("default.roles"), Some("users,staff"));
        assert_eq!(src.get("dynamicroles.auto_create_role"), Some("true"));
        assert_eq!(src.get("dynamicroles.header.SHIB-ROLE"), Some("staff"));
        assert_eq!(src.get("dynamicroles.mapper.staff.match"), Some("staff:(.+)"));
        assert_eq!(src.get("dynamicroles.mapper.staff.casesensitive"), Some("false"));
        assert_eq!(src.get("reload.config"), Some("true"));
        assert_eq!(src.get_u64("reload.config.check.interval").unwrap(), Some(2500));
    }

    #[test]
    fn test_toml_parse_error() {
        let err = PropertySource::from_toml_str("this is = = not toml").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_typed_getters() {
        let src: PropertySource = [("a", "yes"), ("b", "maybe"), ("n", "12"), ("bad", "x")]
            .into_iter()
            .collect();
        assert!(src.get_bool("a", false).unwrap());
        assert!(src.get_bool("missing", true).unwrap());
        assert!(matches!(
            src.get_bool("b", false),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(src.get_u64("n").unwrap(), Some(12));
        assert_eq!(src.get_u64("missing").unwrap(), None);
        assert!(src.get_u64("bad").is_err());
    }

    #[test]
    fn test_keys_are_case_sensitive() {
        let src: PropertySource = [
            ("Header.DynamicRoles.faculty", "f"),
            ("header.dynamicroles.Staff", "s"),
            ("header.dynamicroles.x", "x"),
            ("headers", "h"),
            ("Default.Roles", "users"),
        ]
        .into_iter()
        .collect();
        let found: Vec<_> = src.with_prefix("header.dynamicroles.").collect();
        assert_eq!(found, vec![("Staff", "s"), ("x", "x")]);
        assert_eq!(src.get("default.roles"), None);
        assert_eq!(src.get("Default.Roles"), Some("users"));
    }

    #[test]
    fn test_load_selects_syntax_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let props = dir.path().join("shibmap.properties");
        std::fs::File::create(&props)
            .unwrap()
            .write_all(b"default.roles=users\n")
            .unwrap();
        assert_eq!(PropertySource::load(&props).unwrap().get("default.roles"), Some("users"));

        let toml_path = dir.path().join("shibmap.toml");
        std::fs::write(&toml_path, "default.roles = \"users\"\n").unwrap();
        assert_eq!(PropertySource::load(&toml_path).unwrap().get("default.roles"), Some("users"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = PropertySource::load("/nonexistent/shibmap.properties").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
