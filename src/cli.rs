use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::config::{self, AppConfig};
use crate::logging;
use crate::providers;
use crate::state::StateStore;
use crate::sync::{self, RunContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sync(SyncArgs),
    Users(UsersArgs),
    Help,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncArgs {
    pub config: Option<PathBuf>,
    /// Overrides `state.directory` from the config file.
    pub state: Option<PathBuf>,
    pub verbosity: u8,
    pub quiet: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsersArgs {
    pub config: Option<PathBuf>,
}

/// Parse the arguments after the program name.
///
/// Supported forms:
///   jira2gitlab sync [--config PATH] [--state DIR] [-v|-vv|-q]
///   jira2gitlab users [--config PATH]
///   jira2gitlab help
pub fn parse_args(args: &[String]) -> Result<Command> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };
    match command.as_str() {
        "sync" => parse_sync_args(rest).map(Command::Sync),
        "users" => parse_users_args(rest).map(Command::Users),
        "help" | "-h" | "--help" => Ok(Command::Help),
        other => bail!("Unknown command `{other}`. Run `jira2gitlab help` for usage"),
    }
}

fn value(args: &[String], i: usize, flag: &str) -> Result<PathBuf> {
    match args.get(i) {
        Some(v) if !v.starts_with('-') => Ok(PathBuf::from(v)),
        _ => bail!("Missing value for {flag}"),
    }
}

fn parse_sync_args(args: &[String]) -> Result<SyncArgs> {
    let mut parsed = SyncArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                parsed.config = Some(value(args, i, "--config")?);
            }
            "--state" => {
                i += 1;
                parsed.state = Some(value(args, i, "--state")?);
            }
            "-q" | "--quiet" => parsed.quiet = true,
            flag if flag.len() > 1 && flag.starts_with('-') && flag[1..].chars().all(|c| c == 'v') => {
                parsed.verbosity = parsed.verbosity.saturating_add((flag.len() - 1) as u8);
            }
            "--verbose" => parsed.verbosity = parsed.verbosity.saturating_add(1),
            other => bail!("Unexpected argument `{other}` for sync"),
        }
        i += 1;
    }
    Ok(parsed)
}

fn parse_users_args(args: &[String]) -> Result<UsersArgs> {
    let mut parsed = UsersArgs::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                parsed.config = Some(value(args, i, "--config")?);
            }
            other => bail!("Unexpected argument `{other}` for users"),
        }
        i += 1;
    }
    Ok(parsed)
}

/// Run one import. Returns the process exit code.
pub async fn handle_sync(args: SyncArgs) -> Result<i32> {
    logging::init_logging(args.verbosity, args.quiet)?;
    let config = config::load_config(args.config.as_deref())?;
    let state_dir = args.state.clone().unwrap_or_else(|| config.state_dir());
    let mut store = StateStore::open(&state_dir)
        .with_context(|| format!("Failed to open state store in {}", state_dir.display()))?;
    info!(
        state = %state_dir.display(),
        bindings = store.binding_count(),
        "opened state store"
    );

    let source = providers::create_source(&config);
    let destination = providers::create_destination(&config);
    let ctx = RunContext {
        source: source.as_ref(),
        destination: destination.as_ref(),
        store: &mut store,
        config: &config,
        retry: config.retry.policy(),
    };
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler: never interrupt.
            std::future::pending::<()>().await;
        }
    };
    let report = sync::run(ctx, shutdown).await;

    if let Err(err) = store.compact() {
        tracing::warn!(error = %err, "cannot compact state store");
    }
    print!("{report}");
    Ok(report.exit_code())
}

/// Print how every referenced source user maps to the destination.
pub async fn handle_users(args: UsersArgs) -> Result<()> {
    logging::init_logging(0, true)?;
    let config = config::load_config(args.config.as_deref())?;
    let source = providers::create_source(&config);
    let destination = providers::create_destination(&config);
    let overview = sync::user_overview(
        source.as_ref(),
        destination.as_ref(),
        &config,
        &config.retry.policy(),
    )
    .await?;
    print!("{}", render_users(&overview, &config));
    Ok(())
}

fn render_users(overview: &[sync::UserOverview], config: &AppConfig) -> String {
    if overview.is_empty() {
        return "No users referenced by the configured projects.\n".to_string();
    }
    let width = overview.iter().map(|u| u.name.len()).max().unwrap_or(0);
    let mut out = String::new();
    for user in overview {
        let status = match (user.exists, config.import.migrate_users) {
            (true, _) => "exists",
            (false, true) => "will be created",
            (false, false) => "missing",
        };
        let origin = if user.configured { "mapped" } else { "same name" };
        out.push_str(&format!(
            "{name:<width$}  -> {target} ({origin}, {status}, {refs} issues)\n",
            name = user.name,
            target = user.target,
            refs = user.references,
        ));
    }
    out
}

pub fn print_help() {
    println!("jira2gitlab: incremental Jira to GitLab issue import\n");
    println!("USAGE:");
    println!("  jira2gitlab sync [options]   Import new and changed issues");
    println!("  jira2gitlab users [options]  Show how Jira users map to GitLab users");
    println!("  jira2gitlab help             Show this message");
    println!();
    println!("OPTIONS:");
    println!("  -c, --config <path>  Config file (default ~/.jira2gitlab/config.toml)");
    println!("  --state <dir>        State directory (sync only)");
    println!("  -v, -vv              More log output (sync only)");
    println!("  -q, --quiet          Only log errors (sync only)");
    println!();
    println!("ENVIRONMENT:");
    println!("  JIRA_PASSWORD, GITLAB_TOKEN override the config file");
    println!("  FORCE_REPAIR_JIRA_TABLES=1 repairs malformed Jira tables");
    println!("  RUST_LOG overrides the log filter");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_show_help() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Command::Help);
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), Command::Help);
    }

    #[test]
    fn parse_plain_sync() {
        assert_eq!(
            parse_args(&args(&["sync"])).unwrap(),
            Command::Sync(SyncArgs::default())
        );
    }

    #[test]
    fn parse_sync_options() {
        let Command::Sync(parsed) = parse_args(&args(&[
            "sync",
            "--config",
            "/etc/j2g.toml",
            "--state",
            "/var/lib/j2g",
            "-vv",
        ]))
        .unwrap() else {
            panic!("expected sync");
        };
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/j2g.toml")));
        assert_eq!(parsed.state, Some(PathBuf::from("/var/lib/j2g")));
        assert_eq!(parsed.verbosity, 2);
        assert!(!parsed.quiet);
    }

    #[test]
    fn verbosity_flags_add_up() {
        let Command::Sync(parsed) = parse_args(&args(&["sync", "-v", "--verbose", "-q"])).unwrap()
        else {
            panic!("expected sync");
        };
        assert_eq!(parsed.verbosity, 2);
        assert!(parsed.quiet);
    }

    #[test]
    fn parse_users_with_config() {
        assert_eq!(
            parse_args(&args(&["users", "-c", "j2g.toml"])).unwrap(),
            Command::Users(UsersArgs {
                config: Some(PathBuf::from("j2g.toml")),
            })
        );
    }

    #[test]
    fn missing_flag_value_fails() {
        let result = parse_args(&args(&["sync", "--config"]));
        assert!(result.unwrap_err().to_string().contains("Missing value"));
        let result = parse_args(&args(&["sync", "--state", "-v"]));
        assert!(result.unwrap_err().to_string().contains("Missing value"));
    }

    #[test]
    fn unknown_input_fails() {
        let result = parse_args(&args(&["migrate"]));
        assert!(result.unwrap_err().to_string().contains("Unknown command"));
        let result = parse_args(&args(&["users", "-v"]));
        assert!(result.unwrap_err().to_string().contains("Unexpected argument"));
    }

    #[test]
    fn user_overview_lines() {
        let config = config::parse_config(
            r#"
[jira]
url = "https://jira.example.com"
username = "importer"

[gitlab]
url = "https://gitlab.example.com"

[projects]
PROJ = "group/proj"
"#,
        )
        .unwrap();
        let overview = vec![
            sync::UserOverview {
                name: "Bob".into(),
                target: "bob".into(),
                configured: true,
                exists: false,
                references: 1,
            },
            sync::UserOverview {
                name: "alice".into(),
                target: "alice".into(),
                configured: false,
                exists: true,
                references: 3,
            },
        ];
        assert_eq!(
            render_users(&overview, &config),
            "Bob    -> bob (mapped, missing, 1 issues)\nalice  -> alice (same name, exists, 3 issues)\n"
        );
        assert!(render_users(&[], &config).starts_with("No users"));
    }
}
