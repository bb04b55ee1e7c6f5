//! shibmap command-line tool.
//!
//! Loads an attribute-mapping configuration and evaluates it offline:
//! validate the file, resolve the identity a set of attributes would
//! produce, and preview the membership changes a login would make.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use shibmap_core::config::load_snapshot;
use shibmap_core::reconcile::{MemoryStore, ReconcilePlan, ReconcileReport, Reconciler};
use shibmap_core::text::split_values;
use shibmap_core::{AttributeSet, IdentityResolver, ResolvedIdentity, Snapshot};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// shibmap command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "shibmap",
    version,
    about = "Validate and evaluate Shibboleth attribute-mapping configuration"
)]
struct Cli {
    /// Path to the configuration file (.properties or .toml).
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/shibmap/shibmap.properties"
    )]
    config: PathBuf,

    /// Log filter (trace, debug, info, warn, error). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the configuration and report every problem found.
    Validate,

    /// Show the identity a login with the given attributes resolves to.
    Resolve {
        #[command(flatten)]
        request: RequestArgs,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Preview the membership changes a login would make.
    Plan {
        #[command(flatten)]
        request: RequestArgs,

        /// Roles the principal currently holds (comma or semicolon
        /// separated).
        #[arg(long, default_value = "")]
        current: String,

        /// Apply the plan to an in-memory store holding only these groups
        /// (comma or semicolon separated) and show what would be skipped.
        #[arg(long)]
        existing_groups: Option<String>,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Write a commented sample configuration file.
    Init {
        /// Output path for the generated file.
        #[arg(short, long, default_value = "./shibmap.properties")]
        output: PathBuf,
    },
}

/// The asserted identity of a simulated request.
#[derive(clap::Args, Debug)]
struct RequestArgs {
    /// Remote user as supplied by the front end.
    #[arg(short, long)]
    user: Option<String>,

    /// Attribute as NAME=VALUE. Repeat for more attributes or values.
    #[arg(short = 'a', long = "attribute", value_parser = parse_attribute)]
    attributes: Vec<(String, String)>,
}

fn parse_attribute(s: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{s}'"))?;
    if name.trim().is_empty() {
        return Err(format!("attribute name missing in '{s}'"));
    }
    Ok((name.trim().to_string(), value.to_string()))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Resolve { request, json } => {
            let snapshot = load(&cli.config)?;
            cmd_resolve(&snapshot, &request, json)
        }
        Commands::Plan {
            request,
            current,
            existing_groups,
            json,
        } => {
            let snapshot = load(&cli.config)?;
            cmd_plan(&snapshot, &request, &current, existing_groups.as_deref(), json)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load(path: &Path) -> Result<Snapshot> {
    let (snapshot, warnings) = load_snapshot(path, None)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    for warning in &warnings {
        eprintln!("warning: {warning}");
    }
    Ok(snapshot)
}

fn resolve(snapshot: &Snapshot, request: &RequestArgs) -> Result<ResolvedIdentity> {
    let attrs = AttributeSet::from_pairs(request.attributes.iter().map(|(k, v)| (k, v.as_str())));
    debug!(attributes = ?attrs.names().collect::<Vec<_>>(), "simulated request");

    IdentityResolver::new(snapshot)
        .resolve(request.user.as_deref(), &attrs)
        .context("no username could be derived (pass --user or configure header.remoteuser)")
}

fn join(roles: &BTreeSet<String>) -> String {
    if roles.is_empty() {
        "-".to_string()
    } else {
        roles.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header);
    table
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    let sample = r#"# shibmap configuration
# Lists are separated by commas or semicolons.

# Account maintenance
create.users = true
update.info = true
update.roles = true
update.last.login = false

# Attributes carrying the display name and email address
header.fullname = displayName
header.email = mail

# Username sanitization: strip the scope, then replace anything unusual
remoteuser = scoped
remoteuser.map.scoped.match = ([^@]+)@.*
remoteuser.map.scoped.transform = $1
remoteuser.replace = [^A-Za-z0-9._-], _
username.convertcase = true

# Roles granted to everyone
default.roles = users

# Group discovery: attribute -> rules
dynamicroles.header.SHIB-EP-ENTITLEMENT = staff
dynamicroles.mapper.staff.match = urn:example:staff:(.+)
dynamicroles.mapper.staff.transform = confluence-$1
dynamicroles.mapper.staff.casesensitive = false
dynamicroles.auto_create_role = false
dynamicroles.output.tolowercase = true
dynamicroles.tiebreak = first

# Memberships matching these patterns are removed when no longer asserted
purge.roles = confluence-.*
purge.roles.limit = 0

# Re-read this file when it changes (checked at most every 5 seconds)
reload.config = false
reload.config.check.interval = 5000
convert.to.utf8 = false
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, sample).context("failed to write config file")?;

    println!("Sample configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the attribute names and rules for your federation");
    println!(
        "  2. Validate with: shibmap validate --config {}",
        output.display()
    );
    println!(
        "  3. Try a login: shibmap resolve --config {} --user jdoe@example.org -a SHIB-EP-ENTITLEMENT=urn:example:staff:eng",
        output.display()
    );

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let (snapshot, warnings) =
        load_snapshot(config_path, None).context("failed to parse configuration")?;
    println!("  [OK] File parsed");

    if warnings.is_empty() {
        println!("  [OK] All rules compiled");
    } else {
        for warning in &warnings {
            println!("  [WARN] {}", warning);
        }
    }

    let summary = snapshot.summary();
    let settings = &summary.settings;
    println!();
    println!("Configuration summary:");
    println!("  Default roles    : {}", summary.default_roles.join(", "));
    println!("  Group channels   : {}", summary.group_channels.join(", "));
    println!("  Group rules      : {}", summary.group_rules);
    println!("  Purge rules      : {}", summary.purge_rules);
    println!(
        "  Removal budget   : {}",
        settings
            .removal_budget
            .map(|b| b.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );
    println!(
        "  Username rules   : {} ({} replacements)",
        summary.username_rules, summary.username_replacements
    );
    println!(
        "  Full-name rules  : {} ({} replacements)",
        summary.fullname_rules, summary.fullname_replacements
    );
    println!("  Tie-break        : {}", settings.tie_break);
    println!("  Auto-create      : {}", settings.auto_create_group);
    println!(
        "  Reload           : {}",
        if settings.reload.enabled {
            format!("every {} ms", settings.reload.check_interval_ms)
        } else {
            "disabled".to_string()
        }
    );
    println!();

    if warnings.is_empty() {
        println!("Configuration is valid.");
        Ok(())
    } else {
        anyhow::bail!("{} configuration problem(s) found", warnings.len())
    }
}

fn cmd_resolve(snapshot: &Snapshot, request: &RequestArgs, json: bool) -> Result<()> {
    let identity = resolve(snapshot, request)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&identity)?);
        return Ok(());
    }

    let mut table = new_table(vec!["Field", "Value"]);
    table.add_row(vec![Cell::new("Username"), Cell::new(&identity.username)]);
    table.add_row(vec![Cell::new("Full name"), Cell::new(&identity.full_name)]);
    table.add_row(vec![
        Cell::new("Email"),
        Cell::new(identity.email.as_deref().unwrap_or("-")),
    ]);
    table.add_row(vec![
        Cell::new("Desired roles"),
        Cell::new(join(&identity.desired_roles)),
    ]);
    println!("{table}");

    Ok(())
}

fn cmd_plan(
    snapshot: &Snapshot,
    request: &RequestArgs,
    current: &str,
    existing_groups: Option<&str>,
    json: bool,
) -> Result<()> {
    let identity = resolve(snapshot, request)?;
    let current: BTreeSet<String> = split_values(current).into_iter().collect();
    let reconciler = Reconciler::new(snapshot);
    let plan = reconciler.plan(&identity.desired_roles, &current);

    let report = existing_groups.map(|groups| {
        let store = MemoryStore::with_groups(split_values(groups));
        for role in &current {
            store.grant(&identity.username, role);
        }
        reconciler.apply(&store, &identity.username, &plan)
    });

    if json {
        let value = serde_json::json!({
            "username": identity.username,
            "plan": plan,
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    print_plan(&identity.username, &plan);
    if let Some(report) = &report {
        println!();
        print_report(report);
    }
    Ok(())
}

fn print_plan(username: &str, plan: &ReconcilePlan) {
    println!("Reconciliation plan for {username}");
    let mut table = new_table(vec!["Change", "Roles"]);
    table.add_row(vec![Cell::new("Add"), Cell::new(join(&plan.to_add))]);
    table.add_row(vec![Cell::new("Remove"), Cell::new(join(&plan.to_remove))]);
    table.add_row(vec![Cell::new("Deferred"), Cell::new(join(&plan.deferred))]);
    table.add_row(vec![Cell::new("Kept"), Cell::new(join(&plan.kept))]);
    println!("{table}");

    if plan.is_noop() {
        println!("No changes.");
    }
}

fn print_report(report: &ReconcileReport) {
    println!("Simulated apply");
    let mut table = new_table(vec!["Role", "Result"]);
    for role in &report.added {
        table.add_row(vec![Cell::new(role), Cell::new("added")]);
    }
    for role in &report.removed {
        table.add_row(vec![Cell::new(role), Cell::new("removed")]);
    }
    for role in &report.already_satisfied {
        table.add_row(vec![Cell::new(role), Cell::new("already satisfied")]);
    }
    for skipped in &report.skipped {
        table.add_row(vec![
            Cell::new(&skipped.role),
            Cell::new(format!("skipped: {}", skipped.reason)),
        ]);
    }
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attribute() {
        assert_eq!(
            parse_attribute("SHIB-ROLE=staff:eng;staff:ops").unwrap(),
            ("SHIB-ROLE".to_string(), "staff:eng;staff:ops".to_string())
        );
        assert_eq!(parse_attribute("mail=").unwrap().1, "");
        assert!(parse_attribute("novalue").is_err());
        assert!(parse_attribute("=x").is_err());
    }

    #[test]
    fn test_cli_parses_plan() {
        let cli = Cli::try_parse_from([
            "shibmap",
            "-c",
            "test.properties",
            "plan",
            "--user",
            "jdoe",
            "-a",
            "SHIB-ROLE=staff:eng",
            "--current",
            "confluence-sales,users",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan {
                request,
                current,
                json,
                ..
            } => {
                assert_eq!(request.user.as_deref(), Some("jdoe"));
                assert_eq!(request.attributes.len(), 1);
                assert_eq!(current, "confluence-sales,users");
                assert!(json);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shibmap.properties");
        cmd_init(&path).unwrap();
        assert!(cmd_init(&path).is_err());

        let (snapshot, warnings) = load_snapshot(&path, None).unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(snapshot.default_roles, vec!["users"]);
    }
}
