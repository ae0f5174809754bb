use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProject {
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUser {
    pub name: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusCategory {
    New,
    Indeterminate,
    Done,
    Undefined,
}

impl StatusCategory {
    pub fn from_key(key: &str) -> Self {
        match key {
            "new" => StatusCategory::New,
            "indeterminate" => StatusCategory::Indeterminate,
            "done" => StatusCategory::Done,
            _ => StatusCategory::Undefined,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub category: StatusCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    RelatesTo,
    Blocks,
    Duplicates,
    Clones,
    EpicOf,
    /// Sub-task pointing at its parent.
    SubtaskOf,
    Other(String),
}

impl LinkKind {
    /// Map the outward description of a Jira link type ("blocks", "relates to", ...).
    pub fn from_outward(outward: &str) -> Self {
        match outward.trim().to_lowercase().as_str() {
            "relates to" | "relates" => LinkKind::RelatesTo,
            "blocks" => LinkKind::Blocks,
            "duplicates" => LinkKind::Duplicates,
            "clones" => LinkKind::Clones,
            "is epic of" | "epic of" => LinkKind::EpicOf,
            other => LinkKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LinkKind::RelatesTo => "relates-to",
            LinkKind::Blocks => "blocks",
            LinkKind::Duplicates => "duplicates",
            LinkKind::Clones => "clones",
            LinkKind::EpicOf => "epic-of",
            LinkKind::SubtaskOf => "subtask-of",
            LinkKind::Other(name) => name,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outward link: `issue --kind--> target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLink {
    pub id: String,
    pub kind: LinkKind,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub author: Option<String>,
    pub content_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worklog {
    pub id: String,
    pub author: Option<String>,
    /// Jira notation, e.g. `1d 2h`.
    pub time_spent: String,
    pub started: DateTime<Utc>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIssue {
    pub id: String,
    /// `PROJ-42`
    pub key: String,
    pub title: String,
    pub body: Option<String>,
    pub issue_type: Option<String>,
    pub status: Option<Status>,
    pub resolution: Option<String>,
    pub priority: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub fix_versions: Vec<String>,
    pub reporter: Option<String>,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Parent issue key when this is a sub-task.
    pub parent: Option<String>,
    /// Keys of this issue's sub-tasks.
    #[serde(default)]
    pub subtasks: Vec<String>,
    /// Key of the epic this issue belongs to.
    pub epic: Option<String>,
    #[serde(default)]
    pub links: Vec<SourceLink>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub worklogs: Vec<Worklog>,
    pub story_points: Option<f64>,
    /// Caption -> rendered value, for the configured custom fields only.
    #[serde(default)]
    pub custom_fields: BTreeMap<String, String>,
}

impl SourceIssue {
    pub fn project_key(&self) -> &str {
        project_of(&self.key)
    }

    pub fn is_epic(&self) -> bool {
        self.issue_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("epic"))
    }

    /// Every user this issue refers to, without duplicates, in first-seen order.
    pub fn referenced_users(&self) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        let candidates = [self.reporter.as_ref(), self.assignee.as_ref()]
            .into_iter()
            .flatten()
            .chain(self.comments.iter().filter_map(|c| c.author.as_ref()))
            .chain(self.worklogs.iter().filter_map(|w| w.author.as_ref()))
            .chain(self.attachments.iter().filter_map(|a| a.author.as_ref()));
        for user in candidates {
            if !users.contains(user) {
                users.push(user.clone());
            }
        }
        users
    }
}

/// `PROJ-42` -> `PROJ`
pub fn project_of(key: &str) -> &str {
    key.rsplit_once('-').map_or(key, |(project, _)| project)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_key_is_prefix_before_last_dash() {
        assert_eq!(project_of("PROJ-42"), "PROJ");
        assert_eq!(project_of("MY-PROJ-7"), "MY-PROJ");
        assert_eq!(project_of("ODD"), "ODD");
    }

    #[test]
    fn link_kinds_from_outward_names() {
        assert_eq!(LinkKind::from_outward("blocks"), LinkKind::Blocks);
        assert_eq!(LinkKind::from_outward("Relates to"), LinkKind::RelatesTo);
        assert_eq!(LinkKind::from_outward("duplicates"), LinkKind::Duplicates);
        assert_eq!(
            LinkKind::from_outward("causes"),
            LinkKind::Other("causes".into())
        );
    }
}
