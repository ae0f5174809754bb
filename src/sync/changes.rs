//! Which issues of a project need work in this run.

use chrono::{DateTime, Utc};

use crate::model::source::SourceIssue;
use crate::state::{EntityKind, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    New,
    Changed,
    /// Completely imported by an earlier, interrupted run. Only its links are
    /// looked at again.
    AlreadySynced,
}

#[derive(Debug, Clone, Copy)]
pub struct Selected<'a> {
    pub issue: &'a SourceIssue,
    pub class: ChangeClass,
}

pub fn classify(
    issue: &SourceIssue,
    store: &StateStore,
    cursor: Option<DateTime<Utc>>,
) -> Option<ChangeClass> {
    let Some(binding) = store.binding(&issue.key, EntityKind::Issue) else {
        return Some(ChangeClass::New);
    };
    match binding.last_seen {
        None => Some(ChangeClass::Changed),
        Some(seen) if issue.updated_at > seen => Some(ChangeClass::Changed),
        _ if cursor.map_or(true, |c| issue.updated_at > c) => Some(ChangeClass::AlreadySynced),
        _ => None,
    }
}

/// Selected issues in processing order: `updated_at` ascending, then key.
pub fn select<'a>(
    issues: &'a [SourceIssue],
    store: &StateStore,
    cursor: Option<DateTime<Utc>>,
) -> Vec<Selected<'a>> {
    let mut selected: Vec<Selected<'a>> = issues
        .iter()
        .filter_map(|issue| {
            classify(issue, store, cursor).map(|class| Selected { issue, class })
        })
        .collect();
    selected.sort_by(|a, b| {
        a.issue
            .updated_at
            .cmp(&b.issue.updated_at)
            .then_with(|| a.issue.key.cmp(&b.issue.key))
    });
    selected
}
