use std::collections::BTreeMap;
use std::fmt;

/// A revocation that failed; someone has to remove the admin flag by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualAction {
    pub user: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectSummary {
    pub key: String,
    pub path: String,
    pub imported: usize,
    pub updated: usize,
    pub already_synced: usize,
    /// `(issue key, reason)`
    pub failed: Vec<(String, String)>,
    pub links_created: usize,
    /// Set when a fatal error stopped the project.
    pub aborted: Option<String>,
}

impl ProjectSummary {
    pub fn new(key: &str, path: &str) -> Self {
        Self {
            key: key.to_string(),
            path: path.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub projects: Vec<ProjectSummary>,
    /// Source user -> number of references written as the fallback identity.
    pub unmapped_users: BTreeMap<String, usize>,
    pub users_not_migrated: BTreeMap<String, usize>,
    pub unresolved_links: Vec<String>,
    pub unsupported_links: Vec<String>,
    pub failed_links: Vec<String>,
    pub manual_actions: Vec<ManualAction>,
    pub interrupted: bool,
}

impl RunReport {
    pub fn project_mut(&mut self, key: &str) -> Option<&mut ProjectSummary> {
        self.projects.iter_mut().find(|p| p.key == key)
    }

    /// A clean run: nothing aborted, failed, interrupted or left to do by hand.
    pub fn is_success(&self) -> bool {
        !self.interrupted
            && self.manual_actions.is_empty()
            && self.failed_links.is_empty()
            && self
                .projects
                .iter()
                .all(|p| p.aborted.is_none() && p.failed.is_empty())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

fn write_counts(
    f: &mut fmt::Formatter<'_>,
    title: &str,
    counts: &BTreeMap<String, usize>,
) -> fmt::Result {
    if counts.is_empty() {
        return Ok(());
    }
    writeln!(f, "{title} ({}):", counts.len())?;
    for (user, count) in counts {
        writeln!(f, "  {user}: {count} reference(s)")?;
    }
    Ok(())
}

fn write_list(f: &mut fmt::Formatter<'_>, title: &str, items: &[String]) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    writeln!(f, "{title} ({}):", items.len())?;
    for item in items {
        writeln!(f, "  {item}")?;
    }
    Ok(())
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interrupted {
            writeln!(f, "Run interrupted; re-run to resume.")?;
        }
        for p in &self.projects {
            write!(
                f,
                "{} -> {}: {} imported, {} updated, {} already synced, {} failed, {} links",
                p.key,
                p.path,
                p.imported,
                p.updated,
                p.already_synced,
                p.failed.len(),
                p.links_created
            )?;
            match &p.aborted {
                Some(reason) => writeln!(f, " (aborted: {reason})")?,
                None => writeln!(f)?,
            }
            for (key, reason) in &p.failed {
                writeln!(f, "  {key}: {reason}")?;
            }
        }
        write_counts(f, "Unmapped users", &self.unmapped_users)?;
        write_counts(f, "Users not migrated", &self.users_not_migrated)?;
        write_list(f, "Unresolved links", &self.unresolved_links)?;
        write_list(f, "Unsupported links", &self.unsupported_links)?;
        write_list(f, "Failed links", &self.failed_links)?;
        if !self.manual_actions.is_empty() {
            writeln!(
                f,
                "MANUAL ACTION REQUIRED: remove admin rights of ({}):",
                self.manual_actions.len()
            )?;
            for action in &self.manual_actions {
                writeln!(f, "  {}: {}", action.user, action.reason)?;
            }
        }
        Ok(())
    }
}
