use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `blocks` links are available; otherwise only `relates_to`.
    pub typed_links: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestProject {
    pub id: u64,
    /// `namespace/project`
    pub path: String,
}

/// `namespace/project#iid`, the stable handle of a destination issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueRef {
    pub project: String,
    pub iid: u64,
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project, self.iid)
    }
}

impl FromStr for IssueRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (project, iid) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("not an issue reference: {s}"))?;
        let iid = iid
            .parse()
            .map_err(|_| format!("invalid issue number in {s}"))?;
        if project.is_empty() {
            return Err(format!("missing project in {s}"));
        }
        Ok(IssueRef {
            project: project.to_string(),
            iid,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestUser {
    pub id: u64,
    pub username: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub name: String,
    pub email: String,
    pub password: String,
}

/// Destination-side description of an issue, still holding source user names
/// and a milestone title. Produced by the translator.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueDraft {
    /// Source key, also embedded in the title.
    pub natural_key: String,
    pub title: String,
    pub description: String,
    pub labels: BTreeSet<String>,
    pub milestone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub weight: Option<u32>,
}

/// Issue payload with every reference resolved to a destination id.
#[derive(Debug, Clone, PartialEq)]
pub struct IssueWrite {
    pub natural_key: String,
    pub title: String,
    pub description: String,
    pub labels: Vec<String>,
    pub milestone_id: Option<u64>,
    pub assignee_ids: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub closed: bool,
    pub closed_at: Option<DateTime<Utc>>,
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickAction {
    Spend { time: String, date: NaiveDate },
    Duplicate { target: IssueRef },
}

impl QuickAction {
    pub fn render(&self) -> String {
        match self {
            QuickAction::Spend { time, date } => {
                format!("/spend {time} {}", date.format("%Y-%m-%d"))
            }
            QuickAction::Duplicate { target } => format!("/duplicate {target}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteDraft {
    /// Identity of the note; also written into the body as a marker.
    pub source_id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub body: String,
    pub quick_actions: Vec<QuickAction>,
}

impl NoteDraft {
    /// Final note text: body, quick-action lines, then the identity marker.
    pub fn render(&self) -> String {
        let mut text = self.body.trim_end().to_string();
        for action in &self.quick_actions {
            text.push('\n');
            text.push_str(&action.render());
        }
        text.push_str("\n\n");
        text.push_str(&note_marker(&self.source_id));
        text
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoteWrite {
    pub body: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestLinkKind {
    RelatesTo,
    Blocks,
}

impl DestLinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestLinkKind::RelatesTo => "relates_to",
            DestLinkKind::Blocks => "blocks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Absolute URL of the uploaded file.
    pub url: String,
}

static MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<!-- jira2gitlab:(\S+) -->").expect("static regex"));

pub fn note_marker(source_id: &str) -> String {
    format!("<!-- jira2gitlab:{source_id} -->")
}

/// Source id stored in a note body by [`note_marker`].
pub fn parse_note_marker(body: &str) -> Option<&str> {
    MARKER_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_ref_parses_namespaced_paths() {
        let r: IssueRef = "group/sub/project#12".parse().unwrap();
        assert_eq!(r.project, "group/sub/project");
        assert_eq!(r.iid, 12);
        assert_eq!(r.to_string(), "group/sub/project#12");
        assert!("group/project".parse::<IssueRef>().is_err());
        assert!("#3".parse::<IssueRef>().is_err());
    }

    #[test]
    fn rendered_note_carries_actions_and_marker() {
        let note = NoteDraft {
            source_id: "PROJ-1/worklog/7".into(),
            created_at: None,
            body: "Worked on it\n".into(),
            quick_actions: vec![QuickAction::Spend {
                time: "2h".into(),
                date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            }],
        };
        let text = note.render();
        assert_eq!(
            text,
            "Worked on it\n/spend 2h 2024-03-01\n\n<!-- jira2gitlab:PROJ-1/worklog/7 -->"
        );
        assert_eq!(parse_note_marker(&text), Some("PROJ-1/worklog/7"));
        assert_eq!(parse_note_marker("plain note"), None);
    }
}
