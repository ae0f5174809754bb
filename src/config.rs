use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub jira: JiraConfig,
    pub gitlab: GitLabConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub state: StateConfig,
    /// Jira project key -> GitLab `namespace/project` path.
    pub projects: BTreeMap<String, String>,
    /// Jira username -> GitLab username.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
    #[serde(default)]
    pub issue_types: BTreeMap<String, String>,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub priorities: BTreeMap<String, String>,
    #[serde(default)]
    pub resolutions: BTreeMap<String, String>,
    #[serde(default)]
    pub statuses: BTreeMap<String, String>,
    /// Jira statuses that close the GitLab issue even outside the "done" category.
    #[serde(default)]
    pub closed_statuses: BTreeSet<String>,
    /// Label name -> `#rrggbb`.
    #[serde(default)]
    pub label_colors: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct JiraConfig {
    pub url: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub epic_field: Option<String>,
    pub story_points_field: Option<String>,
    /// Custom field id -> caption of the metadata row.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct GitLabConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_admin")]
    pub admin_username: String,
    /// Force typed-link support on or off instead of asking the instance.
    pub premium: Option<bool>,
}

pub const DEFAULT_COMPONENT_PREFIX: &str = "component:";
pub const DEFAULT_PRIORITY_PREFIX: &str = "priority:";

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub migrate_attachments: bool,
    pub migrate_worklogs: bool,
    /// Create mapped GitLab users that do not exist yet.
    pub migrate_users: bool,
    pub new_user_password: String,
    /// Grant admin rights to users for the duration of the run so that
    /// original timestamps are accepted.
    pub elevate_users: bool,
    /// Label added to every imported issue, if any.
    pub import_label: Option<String>,
    pub label_prefix: String,
    /// Prefix of the labels made from Jira components.
    pub component_prefix: String,
    /// Prefix of the labels made from Jira priorities.
    pub priority_prefix: String,
    pub keep_attachment_filenames: bool,
    /// Give Jira tables without a header row a markdown header, and keep
    /// rows that never close instead of leaving the text as is.
    pub repair_tables: bool,
    /// List every issue of a project instead of only the ones updated since
    /// the cursor. Catches issues created with a backdated timestamp.
    pub full_scan: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            migrate_attachments: true,
            migrate_worklogs: true,
            migrate_users: false,
            new_user_password: "changeMe".into(),
            elevate_users: true,
            import_label: None,
            label_prefix: String::new(),
            component_prefix: DEFAULT_COMPONENT_PREFIX.into(),
            priority_prefix: DEFAULT_PRIORITY_PREFIX.into(),
            keep_attachment_filenames: false,
            repair_tables: false,
            full_scan: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct StateConfig {
    pub directory: Option<PathBuf>,
}

fn default_page_size() -> u32 {
    100
}

fn default_admin() -> String {
    "root".into()
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".jira2gitlab")
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

impl AppConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state.directory.clone().unwrap_or_else(data_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.projects.is_empty() {
            bail!("No projects configured. Add a [projects] table mapping Jira keys to GitLab paths");
        }
        for (key, path) in &self.projects {
            if key.trim().is_empty() {
                bail!("Empty Jira project key in [projects]");
            }
            match path.rsplit_once('/') {
                Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {}
                _ => bail!("GitLab path for {key} must look like `group/project`, got `{path}`"),
            }
        }
        if self.gitlab.token.is_empty() {
            bail!("Missing GitLab token (set gitlab.token or GITLAB_TOKEN)");
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(password) = var("JIRA_PASSWORD") {
            self.jira.password = password;
        }
        if let Some(token) = var("GITLAB_TOKEN") {
            self.gitlab.token = token;
        }
        if let Some(force) = var("FORCE_REPAIR_JIRA_TABLES") {
            self.import.repair_tables = matches!(force.trim(), "1" | "true" | "yes");
        }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents).context("Failed to parse config")?;
    Ok(config)
}

pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let mut config =
        parse_config(&contents).with_context(|| format!("Invalid config {}", path.display()))?;
    config.apply_env();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[jira]
url = "https://jira.example.com"
username = "importer"
password = "secret"

[gitlab]
url = "https://gitlab.example.com"
token = "glpat-123"

[projects]
PROJ = "group/project"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.jira.page_size, 100);
        assert_eq!(config.gitlab.admin_username, "root");
        assert!(config.import.migrate_attachments);
        assert!(config.import.elevate_users);
        assert!(!config.import.migrate_users);
        assert!(!config.import.full_scan);
        assert_eq!(config.import.component_prefix, "component:");
        assert_eq!(config.import.priority_prefix, "priority:");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.projects["PROJ"], "group/project");
        config.validate().unwrap();
    }

    #[test]
    fn mapping_tables_are_read() {
        let text = format!(
            "{MINIMAL}\n[users]\nBob = \"bob\"\n\n[priorities]\nMajor = \"P::normal\"\n\n[label_colors]\n\"P::normal\" = \"#8fbc8f\"\n"
        );
        let config = parse_config(&text).unwrap();
        assert_eq!(config.users["Bob"], "bob");
        assert_eq!(config.priorities["Major"], "P::normal");
        assert_eq!(config.label_colors["P::normal"], "#8fbc8f");
    }

    #[test]
    fn label_prefixes_can_be_overridden() {
        let text = format!(
            "{MINIMAL}\n[import]\ncomponent_prefix = \"C::\"\npriority_prefix = \"P::\"\nfull_scan = true\n"
        );
        let config = parse_config(&text).unwrap();
        assert_eq!(config.import.component_prefix, "C::");
        assert_eq!(config.import.priority_prefix, "P::");
        assert!(config.import.full_scan);
    }

    #[test]
    fn environment_overrides_secrets_and_table_repair() {
        let mut config = parse_config(MINIMAL).unwrap();
        config.apply_overrides(|name| match name {
            "GITLAB_TOKEN" => Some("glpat-env".into()),
            "FORCE_REPAIR_JIRA_TABLES" => Some("1".into()),
            _ => None,
        });
        assert_eq!(config.gitlab.token, "glpat-env");
        assert_eq!(config.jira.password, "secret");
        assert!(config.import.repair_tables);

        config.apply_overrides(|name| (name == "FORCE_REPAIR_JIRA_TABLES").then(|| "0".into()));
        assert!(!config.import.repair_tables);
    }

    #[test]
    fn rejects_project_path_without_namespace() {
        let text = MINIMAL.replace("group/project", "project");
        let config = parse_config(&text).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("group/project"));
    }

    #[test]
    fn rejects_empty_project_map() {
        let text = MINIMAL.replace("PROJ = \"group/project\"", "");
        let config = parse_config(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.jira.username, "importer");
    }

    #[test]
    fn load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
