//! Pure mapping of source entities onto destination drafts.
//!
//! Nothing here performs I/O or looks at the identity map. Users, milestones
//! and link endpoints are returned as named references (source user names,
//! milestone titles, source issue keys) for the orchestrator to resolve.

pub mod markup;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{AppConfig, DEFAULT_COMPONENT_PREFIX, DEFAULT_PRIORITY_PREFIX};
use crate::model::destination::{
    Capabilities, DestLinkKind, IssueDraft, NewUser, NoteDraft, QuickAction,
};
use crate::model::source::{Comment, LinkKind, SourceIssue, SourceUser, Worklog};
use crate::state::EntityKind;

/// GitLab rejects longer titles.
pub const MAX_TITLE_CHARS: usize = 255;

#[derive(Debug, Clone)]
pub struct TranslateConfig {
    pub source_url: String,
    pub label_prefix: String,
    pub component_prefix: String,
    pub priority_prefix: String,
    pub import_label: Option<String>,
    pub issue_types: BTreeMap<String, String>,
    pub components: BTreeMap<String, String>,
    pub priorities: BTreeMap<String, String>,
    pub resolutions: BTreeMap<String, String>,
    pub statuses: BTreeMap<String, String>,
    pub closed_statuses: BTreeSet<String>,
    pub repair_tables: bool,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            label_prefix: String::new(),
            component_prefix: DEFAULT_COMPONENT_PREFIX.into(),
            priority_prefix: DEFAULT_PRIORITY_PREFIX.into(),
            import_label: None,
            issue_types: BTreeMap::new(),
            components: BTreeMap::new(),
            priorities: BTreeMap::new(),
            resolutions: BTreeMap::new(),
            statuses: BTreeMap::new(),
            closed_statuses: BTreeSet::new(),
            repair_tables: false,
        }
    }
}

impl TranslateConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            source_url: config.jira.url.trim_end_matches('/').to_string(),
            label_prefix: config.import.label_prefix.clone(),
            component_prefix: config.import.component_prefix.clone(),
            priority_prefix: config.import.priority_prefix.clone(),
            import_label: config.import.import_label.clone(),
            issue_types: config.issue_types.clone(),
            components: config.components.clone(),
            priorities: config.priorities.clone(),
            resolutions: config.resolutions.clone(),
            statuses: config.statuses.clone(),
            closed_statuses: config.closed_statuses.clone(),
            repair_tables: config.import.repair_tables,
        }
    }
}

/// Facts about an issue that only the orchestrator knows.
#[derive(Debug, Clone, Default)]
pub struct IssueContext {
    /// `(filename, url)` of the uploaded attachments.
    pub attachments: Vec<(String, String)>,
    /// The reporter is impersonated by the fallback identity.
    pub reporter_fallback: bool,
}

/// A source relation waiting for both endpoints to exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingLink {
    pub id: String,
    pub from: String,
    pub to: String,
    pub kind: LinkKind,
}

impl PendingLink {
    pub fn new(from: &str, kind: LinkKind, to: &str) -> Self {
        Self {
            id: format!("{from}/{kind}/{to}"),
            from: from.to_string(),
            to: to.to_string(),
            kind,
        }
    }
}

/// How a source link is carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPlan {
    Link(DestLinkKind),
    /// `/duplicate` quick-action on the `from` issue.
    MarkDuplicate,
    /// Nothing to create; the relation is carried by labels or is meaningless
    /// once imported.
    Skip,
    Unsupported,
}

/// Identity of a child entity, namespaced under its issue key.
pub fn child_id(issue_key: &str, kind: EntityKind, id: &str) -> String {
    format!("{issue_key}/{kind}/{id}")
}

pub struct Translator {
    config: TranslateConfig,
}

impl Translator {
    pub fn new(config: TranslateConfig) -> Self {
        Self { config }
    }

    fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{key}", self.config.source_url)
    }

    fn markdown(&self, issue_key: &str, text: &str, attachments: &[(String, String)]) -> String {
        let project = crate::model::source::project_of(issue_key);
        let converted = markup::to_markdown(
            text,
            project,
            &self.config.source_url,
            self.config.repair_tables,
        );
        markup::replace_attachments(&converted, attachments)
    }

    pub fn issue(&self, issue: &SourceIssue, ctx: &IssueContext) -> IssueDraft {
        let (title, full_title) = issue_title(&issue.title, &issue.key);

        let mut description = String::new();
        if let Some(full) = full_title {
            description.push_str(&format!("Full original title:\n\n{full}\n\n"));
        }
        if let Some(body) = &issue.body {
            description.push_str(&self.markdown(&issue.key, body, &ctx.attachments));
        }
        description.push_str("\n\n___\n\n");
        description.push_str(&format!(
            "**Imported from Jira issue [{key}]({url})**\n\n",
            key = issue.key,
            url = self.browse_url(&issue.key)
        ));
        if ctx.reporter_fallback {
            if let Some(reporter) = &issue.reporter {
                description.push_str(&format!(
                    "**Original creator of the issue: Jira user {reporter}**\n\n"
                ));
            }
        }
        for (filename, url) in &ctx.attachments {
            if !description.contains(url.as_str()) {
                description.push_str(&format!(
                    "Attachment imported from Jira issue [{key}]({link}): ![{filename}]({url})\n\n",
                    key = issue.key,
                    link = self.browse_url(&issue.key)
                ));
            }
        }

        let closed = issue.status.as_ref().is_some_and(|s| {
            s.category == crate::model::source::StatusCategory::Done
                || self.config.closed_statuses.contains(&s.name)
        });

        IssueDraft {
            natural_key: issue.key.clone(),
            title,
            description: description.trim_end().to_string(),
            labels: self.labels(issue),
            milestone: milestone(&issue.fix_versions),
            created_at: issue.created_at,
            closed,
            closed_at: if closed { issue.resolved_at } else { None },
            weight: issue
                .story_points
                .filter(|p| p.is_finite() && *p >= 0.0)
                .map(|p| p as u32),
        }
    }

    pub fn labels(&self, issue: &SourceIssue) -> BTreeSet<String> {
        let c = &self.config;
        let mut labels = BTreeSet::new();

        if let Some(marker) = &c.import_label {
            labels.insert(marker.clone());
        }
        for label in &issue.labels {
            labels.insert(format!("{}{label}", c.label_prefix));
        }
        if let Some(issue_type) = &issue.issue_type {
            labels.insert(mapped(&c.issue_types, "type:", issue_type));
        }
        for component in &issue.components {
            labels.insert(mapped(&c.components, &c.component_prefix, component));
        }
        if let Some(priority) = &issue.priority {
            labels.insert(mapped(&c.priorities, &c.priority_prefix, priority));
        }
        if let Some(status) = &issue.status {
            labels.insert(mapped(&c.statuses, "status:", &status.name));
        }
        if let Some(resolution) = &issue.resolution {
            labels.insert(mapped(&c.resolutions, "resolution:", resolution));
        }
        if let Some(epic) = epic_key(issue) {
            labels.insert(epic_label(epic));
        }
        labels.retain(|l| !l.trim().is_empty());
        labels
    }

    pub fn comment(
        &self,
        issue_key: &str,
        comment: &Comment,
        author_fallback: bool,
        attachments: &[(String, String)],
    ) -> NoteDraft {
        let mut body = String::new();
        if author_fallback {
            if let Some(author) = &comment.author {
                body.push_str(&format!("[ Original comment made by Jira user {author} ]\n\n"));
            }
        }
        body.push_str(&self.markdown(issue_key, &comment.body, attachments));
        NoteDraft {
            source_id: child_id(issue_key, EntityKind::Comment, &comment.id),
            created_at: Some(comment.created_at),
            body,
            quick_actions: Vec::new(),
        }
    }

    pub fn worklog(
        &self,
        issue_key: &str,
        worklog: &Worklog,
        attachments: &[(String, String)],
    ) -> NoteDraft {
        let date = worklog.started.date_naive();
        let author = worklog.author.as_deref().unwrap_or("unknown");
        let mut body = format!(
            "[ Worklog {spent} by Jira user {author} on {date} ]",
            spent = worklog.time_spent,
            date = date.format("%Y-%m-%d")
        );
        if let Some(comment) = worklog.comment.as_deref().filter(|c| !c.trim().is_empty()) {
            body.push_str("\n\n");
            body.push_str(&self.markdown(issue_key, comment, attachments));
        }
        NoteDraft {
            source_id: child_id(issue_key, EntityKind::Worklog, &worklog.id),
            created_at: Some(worklog.started),
            body,
            quick_actions: vec![QuickAction::Spend {
                time: worklog.time_spent.clone(),
                date,
            }],
        }
    }

    /// One table note for the configured custom fields, if any are set.
    pub fn custom_fields(&self, issue: &SourceIssue) -> Option<NoteDraft> {
        let rows: Vec<String> = issue
            .custom_fields
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(caption, value)| format!("| {caption} | {} |", value.replace('\n', "<br>")))
            .collect();
        if rows.is_empty() {
            return None;
        }
        let body = format!(
            "| Additional metadata | Content |\n| - | - |\n{}",
            rows.join("\n")
        );
        Some(NoteDraft {
            source_id: child_id(&issue.key, EntityKind::Metadata, "custom-fields"),
            created_at: None,
            body,
            quick_actions: Vec::new(),
        })
    }

    pub fn user(&self, user: &SourceUser, username: &str, password: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            name: user.display_name.clone(),
            email: user
                .email
                .clone()
                .unwrap_or_else(|| format!("{username}@users.noreply.invalid")),
            password: password.to_string(),
        }
    }
}

/// `"{title} [{key}]"`, shortened to fit while keeping the key. The second
/// value is the full title when it had to be shortened.
pub fn issue_title(title: &str, key: &str) -> (String, Option<String>) {
    let suffix = format!(" [{key}]");
    let full = format!("{title}{suffix}");
    if full.chars().count() <= MAX_TITLE_CHARS {
        return (full, None);
    }
    let room = MAX_TITLE_CHARS.saturating_sub(suffix.chars().count() + 3);
    let short: String = title.chars().take(room).collect();
    (format!("{}...{suffix}", short.trim_end()), Some(title.to_string()))
}

fn mapped(map: &BTreeMap<String, String>, prefix: &str, name: &str) -> String {
    map.get(name)
        .cloned()
        .unwrap_or_else(|| format!("{prefix}{name}"))
}

fn epic_key(issue: &SourceIssue) -> Option<&str> {
    if issue.is_epic() {
        Some(&issue.key)
    } else {
        issue.epic.as_deref()
    }
}

/// Label shared by an epic and every issue that belongs to it.
pub fn epic_label(epic_key: &str) -> String {
    format!("epic:{epic_key}")
}

/// The last fix-version by version ordering.
pub fn milestone(fix_versions: &[String]) -> Option<String> {
    fix_versions
        .iter()
        .max_by(|a, b| compare_versions(a, b))
        .cloned()
}

/// Segment-wise comparison, numeric where both segments are numbers.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |v: &str| -> Vec<String> {
        v.split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    };
    let (left, right) = (split(a), split(b));
    for (l, r) in left.iter().zip(right.iter()) {
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

/// Relations of `issue` to materialise in the second pass: its outward
/// links and the sub-task relation seen from either side.
pub fn pending_links(issue: &SourceIssue) -> Vec<PendingLink> {
    let mut links: BTreeSet<PendingLink> = BTreeSet::new();
    for link in &issue.links {
        links.insert(PendingLink::new(&issue.key, link.kind.clone(), &link.target));
    }
    if let Some(parent) = &issue.parent {
        links.insert(PendingLink::new(&issue.key, LinkKind::SubtaskOf, parent));
    }
    for subtask in &issue.subtasks {
        links.insert(PendingLink::new(subtask, LinkKind::SubtaskOf, &issue.key));
    }
    links.into_iter().collect()
}

pub fn link_plan(kind: &LinkKind, capabilities: Capabilities) -> LinkPlan {
    let typed = if capabilities.typed_links {
        DestLinkKind::Blocks
    } else {
        DestLinkKind::RelatesTo
    };
    match kind {
        LinkKind::RelatesTo => LinkPlan::Link(DestLinkKind::RelatesTo),
        LinkKind::Blocks | LinkKind::SubtaskOf => LinkPlan::Link(typed),
        LinkKind::Duplicates => LinkPlan::MarkDuplicate,
        LinkKind::Clones | LinkKind::EpicOf => LinkPlan::Skip,
        LinkKind::Other(_) => LinkPlan::Unsupported,
    }
}
