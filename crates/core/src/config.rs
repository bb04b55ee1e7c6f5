//! Configuration keys, typed settings, and snapshot construction.
//!
//! A [`PropertySource`] is turned into a [`Snapshot`] in one deterministic
//! pass. Problems with individual entries (a bad regex, an unknown rule
//! label, an unparsable boolean) are collected as warnings and logged; the
//! affected entry falls back to its default and everything else still loads.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, CoreError, RuleError};
use crate::identity::LoginPolicy;
use crate::pipeline::{ReplacementList, TieBreak};
use crate::properties::PropertySource;
use crate::registry::{fold, RuleRegistry, FULLNAME_CHANNEL, PURGE_CHANNEL, USERNAME_CHANNEL};
use crate::rule::RuleSpec;
use crate::snapshot::{Provenance, Snapshot};
use crate::text::{parse_bool, split_values};

/// Recognized configuration keys.
pub mod keys {
    pub const DEFAULT_ROLES: &str = "default.roles";
    pub const PURGE_ROLES: &str = "purge.roles";
    pub const PURGE_ROLES_LIMIT: &str = "purge.roles.limit";

    /// `dynamicroles.header.<CHANNEL> = label, label, ...`
    pub const ROLE_HEADER_PREFIX: &str = "dynamicroles.header.";
    /// `dynamicroles.mapper.<LABEL>.match|transform|casesensitive`
    pub const ROLE_MAPPER_PREFIX: &str = "dynamicroles.mapper.";
    pub const AUTO_CREATE_ROLE: &str = "dynamicroles.auto_create_role";
    pub const OUTPUT_TO_LOWERCASE: &str = "dynamicroles.output.tolowercase";
    pub const TIE_BREAK: &str = "dynamicroles.tiebreak";

    pub const REMOTEUSER: &str = "remoteuser";
    pub const REMOTEUSER_REPLACE: &str = "remoteuser.replace";
    pub const REMOTEUSER_MAP_PREFIX: &str = "remoteuser.map.";

    pub const FULLNAME: &str = "fullname";
    pub const FULLNAME_REPLACE: &str = "fullname.replace";
    pub const FULLNAME_MAP_PREFIX: &str = "fullname.map.";

    pub const RELOAD_CONFIG: &str = "reload.config";
    pub const RELOAD_CHECK_INTERVAL: &str = "reload.config.check.interval";
    pub const CONVERT_TO_UTF8: &str = "convert.to.utf8";
    pub const USERNAME_CONVERT_CASE: &str = "username.convertcase";

    pub const CREATE_USERS: &str = "create.users";
    pub const UPDATE_INFO: &str = "update.info";
    pub const UPDATE_ROLES: &str = "update.roles";
    pub const UPDATE_LAST_LOGIN: &str = "update.last.login";

    pub const HEADER_FULLNAME: &str = "header.fullname";
    pub const HEADER_EMAIL: &str = "header.email";
    pub const HEADER_REMOTEUSER: &str = "header.remoteuser";

    /// `header.dynamicroles.attributenames = attr, attr, ...`
    pub const LEGACY_ATTRIBUTE_NAMES: &str = "header.dynamicroles.attributenames";
    /// `header.dynamicroles.<value> = group, group, ...`
    pub const LEGACY_ROLE_PREFIX: &str = "header.dynamicroles.";
}

/// Default reload check interval in milliseconds.
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 5000;

// ---------------------------------------------------------------------------
// Typed settings
// ---------------------------------------------------------------------------

/// Scalar settings of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Create a missing group instead of skipping the membership.
    pub auto_create_group: bool,
    /// Lowercase discovered group names.
    pub output_lowercase: bool,
    /// Re-interpret mis-decoded header values as UTF-8.
    pub convert_to_utf8: bool,
    /// Lowercase the sanitized username.
    pub username_convert_case: bool,
    /// Maximum memberships removed in one reconciliation. `None` is
    /// unbounded.
    pub removal_budget: Option<usize>,
    pub tie_break: TieBreak,
    pub reload: ReloadSettings,
    pub headers: HeaderNames,
    pub login: LoginPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_create_group: false,
            output_lowercase: true,
            convert_to_utf8: false,
            username_convert_case: true,
            removal_budget: None,
            tie_break: TieBreak::default(),
            reload: ReloadSettings::default(),
            headers: HeaderNames::default(),
            login: LoginPolicy::default(),
        }
    }
}

/// File-watch settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSettings {
    pub enabled: bool,
    /// Minimum time between two modification-time checks, in milliseconds.
    pub check_interval_ms: u64,
}

impl ReloadSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
        }
    }
}

/// Attributes that carry scalar identity data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNames {
    pub fullname: Option<String>,
    pub email: Option<String>,
    /// Consulted only when the front end supplies no remote user.
    pub remote_user: Option<String>,
}

// ---------------------------------------------------------------------------
// Snapshot construction
// ---------------------------------------------------------------------------

/// Load `path` and build a snapshot from it, reusing unchanged rules from
/// `previous`.
///
/// Fails only when the file cannot be read or parsed as a whole; problems
/// with individual entries come back as warnings.
pub fn load_snapshot<P: AsRef<Path>>(
    path: P,
    previous: Option<&Snapshot>,
) -> Result<(Snapshot, Vec<CoreError>), ConfigError> {
    let path = path.as_ref();
    // Read the mtime first: a write racing with the read is picked up by the
    // next check.
    let last_modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let source = PropertySource::load(path)?;

    let (mut snapshot, warnings) = build_snapshot(&source, previous);
    snapshot.provenance.path = Some(path.to_path_buf());
    snapshot.provenance.last_modified = last_modified;

    info!(
        path = %path.display(),
        generation = snapshot.provenance.generation,
        group_rules = snapshot.roles.len(),
        purge_rules = snapshot.purge.len(),
        warnings = warnings.len(),
        "configuration snapshot built"
    );
    Ok((snapshot, warnings))
}

/// Build a snapshot from an in-memory source.
pub fn build_snapshot(
    source: &PropertySource,
    previous: Option<&Snapshot>,
) -> (Snapshot, Vec<CoreError>) {
    let mut warnings = Vec::new();

    let settings = read_settings(source, &mut warnings);
    let default_roles = read_default_roles(source);
    let roles = build_role_registry(source, previous.map(|p| &p.roles), &mut warnings);
    let purge = build_purge_registry(source, previous.map(|p| &p.purge), &mut warnings);
    let username = build_name_registry(
        source,
        NameKeys {
            labels: keys::REMOTEUSER,
            map_prefix: keys::REMOTEUSER_MAP_PREFIX,
            channel: USERNAME_CHANNEL,
        },
        previous.map(|p| &p.username),
        &mut warnings,
    );
    let fullname = build_name_registry(
        source,
        NameKeys {
            labels: keys::FULLNAME,
            map_prefix: keys::FULLNAME_MAP_PREFIX,
            channel: FULLNAME_CHANNEL,
        },
        previous.map(|p| &p.fullname),
        &mut warnings,
    );
    let username_replace = read_replacements(source, keys::REMOTEUSER_REPLACE, &mut warnings);
    let fullname_replace = read_replacements(source, keys::FULLNAME_REPLACE, &mut warnings);

    for warning in &warnings {
        warn!(error = %warning, "configuration entry ignored");
    }

    let provenance = Provenance {
        generation: previous.map_or(0, |p| p.provenance.generation + 1),
        ..Provenance::default()
    };

    let snapshot = Snapshot {
        settings,
        default_roles,
        roles,
        purge,
        username,
        fullname,
        username_replace,
        fullname_replace,
        provenance,
    };
    (snapshot, warnings)
}

fn read_settings(source: &PropertySource, warnings: &mut Vec<CoreError>) -> Settings {
    let defaults = Settings::default();
    let mut flag = |key: &str, default: bool| match source.get_bool(key, default) {
        Ok(value) => value,
        Err(e) => {
            warnings.push(e.into());
            default
        }
    };

    let auto_create_group = flag(keys::AUTO_CREATE_ROLE, defaults.auto_create_group);
    let output_lowercase = flag(keys::OUTPUT_TO_LOWERCASE, defaults.output_lowercase);
    let convert_to_utf8 = flag(keys::CONVERT_TO_UTF8, defaults.convert_to_utf8);
    let username_convert_case = flag(keys::USERNAME_CONVERT_CASE, defaults.username_convert_case);
    let reload_enabled = flag(keys::RELOAD_CONFIG, defaults.reload.enabled);
    let login = LoginPolicy {
        create_users: flag(keys::CREATE_USERS, false),
        update_info: flag(keys::UPDATE_INFO, false),
        update_roles: flag(keys::UPDATE_ROLES, false),
        update_last_login: flag(keys::UPDATE_LAST_LOGIN, false),
    };

    let check_interval_ms = match source.get_u64(keys::RELOAD_CHECK_INTERVAL) {
        Ok(value) => value.unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
        Err(e) => {
            warnings.push(e.into());
            DEFAULT_CHECK_INTERVAL_MS
        }
    };

    let removal_budget = match source.get_u64(keys::PURGE_ROLES_LIMIT) {
        Ok(Some(0)) | Ok(None) => None,
        Ok(Some(n)) => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        Err(e) => {
            warnings.push(e.into());
            None
        }
    };

    let tie_break = match source.get(keys::TIE_BREAK).map(str::parse::<TieBreak>) {
        None => TieBreak::default(),
        Some(Ok(strategy)) => strategy,
        Some(Err(detail)) => {
            warnings.push(
                ConfigError::InvalidValue {
                    key: keys::TIE_BREAK.to_string(),
                    detail,
                }
                .into(),
            );
            TieBreak::default()
        }
    };

    let header = |key: &str| source.get(key).map(str::to_string);
    let headers = HeaderNames {
        fullname: header(keys::HEADER_FULLNAME),
        email: header(keys::HEADER_EMAIL),
        remote_user: header(keys::HEADER_REMOTEUSER),
    };

    debug!(
        auto_create_group,
        output_lowercase,
        convert_to_utf8,
        username_convert_case,
        reload_enabled,
        check_interval_ms,
        ?removal_budget,
        %tie_break,
        "settings read"
    );

    Settings {
        auto_create_group,
        output_lowercase,
        convert_to_utf8,
        username_convert_case,
        removal_budget,
        tie_break,
        reload: ReloadSettings {
            enabled: reload_enabled,
            check_interval_ms,
        },
        headers,
        login,
    }
}

fn read_default_roles(source: &PropertySource) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for role in split_values(source.get(keys::DEFAULT_ROLES).unwrap_or_default()) {
        if !roles.contains(&role) {
            roles.push(role);
        }
    }
    roles
}

/// Collect `<prefix><label>.match|transform|casesensitive` entries into rule
/// definitions, ordered by label.
fn read_rule_specs(
    source: &PropertySource,
    prefix: &str,
    warnings: &mut Vec<CoreError>,
) -> Vec<RuleSpec> {
    #[derive(Default)]
    struct Parts {
        match_pattern: Option<String>,
        transform: Option<String>,
        case_sensitive: Option<bool>,
    }

    let mut parts: std::collections::BTreeMap<String, Parts> = Default::default();

    for (rest, value) in source.with_prefix(prefix) {
        let invalid = |detail: String| ConfigError::InvalidValue {
            key: format!("{prefix}{rest}"),
            detail,
        };

        let Some((label, attribute)) = rest.rsplit_once('.') else {
            warnings.push(invalid("expected <label>.match, .transform or .casesensitive".into()).into());
            continue;
        };
        let entry = parts.entry(fold(label)).or_default();
        let value = value.trim();

        match attribute.to_ascii_lowercase().as_str() {
            "match" => entry.match_pattern = Some(value.to_string()),
            "transform" => entry.transform = Some(value.to_string()),
            "casesensitive" => match parse_bool(value) {
                Some(b) => entry.case_sensitive = Some(b),
                None => warnings.push(invalid(format!("'{value}' is not a boolean, using true")).into()),
            },
            other => warnings.push(invalid(format!("unknown rule attribute '{other}'")).into()),
        }
    }

    parts
        .into_iter()
        .filter(|(label, _)| !label.is_empty())
        .map(|(label, p)| {
            RuleSpec::new(
                label,
                p.match_pattern.as_deref(),
                p.transform.as_deref(),
                p.case_sensitive.unwrap_or(true),
            )
        })
        .collect()
}

fn build_role_registry(
    source: &PropertySource,
    previous: Option<&RuleRegistry>,
    warnings: &mut Vec<CoreError>,
) -> RuleRegistry {
    let mut builder = RuleRegistry::builder();
    if let Some(previous) = previous {
        builder = builder.reuse_from(previous);
    }

    for spec in read_rule_specs(source, keys::ROLE_MAPPER_PREFIX, warnings) {
        builder.define(spec);
    }
    for (channel, labels) in source.with_prefix(keys::ROLE_HEADER_PREFIX) {
        if channel.trim().is_empty() {
            continue;
        }
        builder.bind(channel, split_values(labels));
    }

    // Static value → groups table. Each entry becomes a case-insensitive
    // exact-match rule bound to every listed attribute.
    let legacy_attributes = split_values(source.get(keys::LEGACY_ATTRIBUTE_NAMES).unwrap_or_default());
    let mut legacy_labels = Vec::new();
    for (raw_value, groups) in source.with_prefix(keys::LEGACY_ROLE_PREFIX) {
        let value = fold(raw_value);
        let groups = split_values(groups);
        if value.is_empty() || value == "attributenames" || groups.is_empty() {
            continue;
        }
        let label = format!("legacy-{value}");
        if builder.is_defined(&label) {
            warnings.push(
                ConfigError::InvalidValue {
                    key: format!("{}{raw_value}", keys::LEGACY_ROLE_PREFIX),
                    detail: format!("rule label '{label}' is already defined by a mapper, ignoring this entry"),
                }
                .into(),
            );
            continue;
        }
        builder.define(RuleSpec::new(
            label.as_str(),
            Some(&regex_lite::escape(&value)),
            Some(&groups.join(",")),
            false,
        ));
        legacy_labels.push(label);
    }
    if !legacy_labels.is_empty() {
        if legacy_attributes.is_empty() {
            warnings.push(
                ConfigError::InvalidValue {
                    key: keys::LEGACY_ATTRIBUTE_NAMES.to_string(),
                    detail: format!("{} role mappings declared but no attribute names", legacy_labels.len()),
                }
                .into(),
            );
        }
        for attribute in &legacy_attributes {
            builder.bind(attribute, &legacy_labels);
        }
    }

    collect(builder.build(), warnings)
}

fn build_purge_registry(
    source: &PropertySource,
    previous: Option<&RuleRegistry>,
    warnings: &mut Vec<CoreError>,
) -> RuleRegistry {
    let mut builder = RuleRegistry::builder();
    if let Some(previous) = previous {
        builder = builder.reuse_from(previous);
    }

    let patterns = split_values(source.get(keys::PURGE_ROLES).unwrap_or_default());
    for (index, pattern) in patterns.iter().enumerate() {
        builder.define_and_bind(
            PURGE_CHANNEL,
            RuleSpec::new(format!("purge-{index}"), Some(pattern), None, true),
        );
    }

    collect(builder.build(), warnings)
}

struct NameKeys {
    labels: &'static str,
    map_prefix: &'static str,
    channel: &'static str,
}

fn build_name_registry(
    source: &PropertySource,
    names: NameKeys,
    previous: Option<&RuleRegistry>,
    warnings: &mut Vec<CoreError>,
) -> RuleRegistry {
    let mut builder = RuleRegistry::builder();
    if let Some(previous) = previous {
        builder = builder.reuse_from(previous);
    }

    for spec in read_rule_specs(source, names.map_prefix, warnings) {
        builder.define(spec);
    }
    if let Some(labels) = source.get(names.labels) {
        builder.bind(names.channel, split_values(labels));
    }

    collect(builder.build(), warnings)
}

fn read_replacements(
    source: &PropertySource,
    key: &str,
    warnings: &mut Vec<CoreError>,
) -> ReplacementList {
    let Some(raw) = source.get(key) else {
        return ReplacementList::default();
    };
    let (list, errors) = ReplacementList::parse(key, raw);
    warnings.extend(errors.into_iter().map(CoreError::from));
    list
}

fn collect(
    (registry, errors): (RuleRegistry, Vec<RuleError>),
    warnings: &mut Vec<CoreError>,
) -> RuleRegistry {
    warnings.extend(errors.into_iter().map(CoreError::from));
    registry
}
