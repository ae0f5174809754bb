//! In-memory collaborators for engine tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use super::{ApiResult, DestinationTracker, SourceTracker};
use crate::error::ApiError;
use crate::model::destination::{
    parse_note_marker, Capabilities, DestLinkKind, DestProject, DestUser, IssueRef, IssueWrite,
    NewUser, NoteWrite, QuickAction, UploadedFile,
};
use crate::model::source::{Attachment, SourceIssue, SourceProject, SourceUser};

#[derive(Default)]
pub struct FakeSource {
    pub issues: Mutex<BTreeMap<String, SourceIssue>>,
    pub users: Mutex<BTreeMap<String, SourceUser>>,
}

impl FakeSource {
    pub fn with_issues(issues: Vec<SourceIssue>) -> Self {
        let source = Self::default();
        for issue in issues {
            source.put(issue);
        }
        source
    }

    pub fn put(&self, issue: SourceIssue) {
        self.issues.lock().unwrap().insert(issue.key.clone(), issue);
    }

    pub fn add_user(&self, name: &str, email: &str) {
        self.users.lock().unwrap().insert(
            name.to_string(),
            SourceUser {
                name: name.to_string(),
                display_name: name.to_uppercase(),
                email: Some(email.to_string()),
            },
        );
    }
}

#[async_trait]
impl SourceTracker for FakeSource {
    fn name(&self) -> &str {
        "fake source"
    }

    async fn list_projects(&self) -> ApiResult<Vec<SourceProject>> {
        let issues = self.issues.lock().unwrap();
        let keys: BTreeSet<String> = issues.values().map(|i| i.project_key().to_string()).collect();
        Ok(keys
            .into_iter()
            .map(|key| SourceProject {
                name: key.clone(),
                key,
            })
            .collect())
    }

    async fn list_issues(
        &self,
        project: &str,
        since: Option<DateTime<Utc>>,
    ) -> ApiResult<Vec<SourceIssue>> {
        tokio::task::yield_now().await;
        let issues = self.issues.lock().unwrap();
        let mut listed: Vec<SourceIssue> = issues
            .values()
            .filter(|i| i.project_key() == project)
            .filter(|i| since.map_or(true, |s| i.updated_at >= s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(listed)
    }

    async fn get_issue(&self, key: &str) -> ApiResult<SourceIssue> {
        self.issues
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                operation: format!("get issue {key}"),
            })
    }

    async fn get_user(&self, name: &str) -> ApiResult<SourceUser> {
        self.users
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ApiError::NotFound {
                operation: format!("get user {name}"),
            })
    }

    async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Vec<u8>> {
        Ok(attachment.content_url.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct FakeNote {
    pub id: u64,
    pub body: String,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct FakeIssue {
    pub write: IssueWrite,
    pub author: Option<String>,
    pub notes: Vec<FakeNote>,
    pub duplicate_of: Option<IssueRef>,
}

#[derive(Default)]
pub struct DestState {
    pub projects: BTreeMap<String, u64>,
    pub issues: BTreeMap<String, BTreeMap<u64, FakeIssue>>,
    pub labels: BTreeMap<(String, String), String>,
    pub milestones: BTreeMap<(String, String), u64>,
    pub users: BTreeMap<String, DestUser>,
    pub links: BTreeSet<(String, String, &'static str)>,
    pub uploads: Vec<(String, String)>,
    pub writes: usize,
    pub issue_creates: usize,
    next_id: u64,
}

impl DestState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct FakeDestination {
    pub state: Mutex<DestState>,
    pub typed_links: bool,
    /// Notified right after the issue create with this ordinal (1-based).
    pub interrupt_after_creates: Option<usize>,
    pub interrupt: Arc<Notify>,
    /// Issue keys whose creation is rejected.
    pub reject_issues: BTreeSet<String>,
    /// Usernames whose admin flag cannot be removed.
    pub failing_revokes: BTreeSet<String>,
}

impl FakeDestination {
    pub fn new(typed_links: bool) -> Self {
        Self {
            typed_links,
            ..Self::default()
        }
    }

    pub fn add_user(&self, id: u64, username: &str, is_admin: bool) {
        self.state.lock().unwrap().users.insert(
            username.to_string(),
            DestUser {
                id,
                username: username.to_string(),
                is_admin,
            },
        );
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn issue_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .issues
            .values()
            .map(|issues| issues.len())
            .sum()
    }

    /// Issue whose title ends with `[key]`.
    pub fn issue_by_key(&self, key: &str) -> Option<(IssueRef, FakeIssue)> {
        let suffix = format!("[{key}]");
        let state = self.state.lock().unwrap();
        state.issues.iter().find_map(|(project, issues)| {
            issues.iter().find_map(|(iid, issue)| {
                issue.write.title.ends_with(&suffix).then(|| {
                    (
                        IssueRef {
                            project: project.clone(),
                            iid: *iid,
                        },
                        issue.clone(),
                    )
                })
            })
        })
    }

    pub fn issues_titled(&self, key: &str) -> usize {
        let suffix = format!("[{key}]");
        let state = self.state.lock().unwrap();
        state
            .issues
            .values()
            .flat_map(|issues| issues.values())
            .filter(|i| i.write.title.ends_with(&suffix))
            .count()
    }

    pub fn links(&self) -> Vec<(String, String, &'static str)> {
        self.state.lock().unwrap().links.iter().cloned().collect()
    }

    pub fn admins(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .users
            .values()
            .filter(|u| u.is_admin)
            .map(|u| u.username.clone())
            .collect()
    }

    fn issue_mut<'s>(state: &'s mut DestState, issue: &IssueRef) -> ApiResult<&'s mut FakeIssue> {
        state
            .issues
            .get_mut(&issue.project)
            .and_then(|issues| issues.get_mut(&issue.iid))
            .ok_or_else(|| ApiError::NotFound {
                operation: format!("issue {issue}"),
            })
    }
}

#[async_trait]
impl DestinationTracker for FakeDestination {
    fn name(&self) -> &str {
        "fake destination"
    }

    async fn capabilities(&self) -> ApiResult<Capabilities> {
        Ok(Capabilities {
            typed_links: self.typed_links,
        })
    }

    async fn ensure_project(&self, path: &str) -> ApiResult<DestProject> {
        let mut state = self.state.lock().unwrap();
        let id = match state.projects.get(path) {
            Some(id) => *id,
            None => {
                let id = state.next_id();
                state.projects.insert(path.to_string(), id);
                state.writes += 1;
                id
            }
        };
        Ok(DestProject {
            id,
            path: path.to_string(),
        })
    }

    async fn find_issue(&self, project: &str, natural_key: &str) -> ApiResult<Option<IssueRef>> {
        let suffix = format!("[{natural_key}]");
        let state = self.state.lock().unwrap();
        Ok(state.issues.get(project).and_then(|issues| {
            issues
                .iter()
                .find(|(_, i)| i.write.title.ends_with(&suffix))
                .map(|(iid, _)| IssueRef {
                    project: project.to_string(),
                    iid: *iid,
                })
        }))
    }

    async fn create_issue(
        &self,
        project: &str,
        issue: &IssueWrite,
        as_user: Option<&str>,
    ) -> ApiResult<IssueRef> {
        if self.reject_issues.contains(&issue.natural_key) {
            return Err(ApiError::Rejected {
                operation: format!("create issue {}", issue.natural_key),
                status: 400,
                message: "rejected by test".into(),
            });
        }
        let (issue_ref, creates) = {
            let mut state = self.state.lock().unwrap();
            let issues = state.issues.entry(project.to_string()).or_default();
            let iid = issues.keys().next_back().map_or(1, |last| last + 1);
            issues.insert(
                iid,
                FakeIssue {
                    write: issue.clone(),
                    author: as_user.map(str::to_string),
                    notes: Vec::new(),
                    duplicate_of: None,
                },
            );
            state.writes += 1;
            state.issue_creates += 1;
            (
                IssueRef {
                    project: project.to_string(),
                    iid,
                },
                state.issue_creates,
            )
        };
        if self.interrupt_after_creates == Some(creates) {
            self.interrupt.notify_one();
            tokio::task::yield_now().await;
        }
        Ok(issue_ref)
    }

    async fn update_issue(&self, issue: &IssueRef, write: &IssueWrite) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        Self::issue_mut(&mut state, issue)?.write = write.clone();
        state.writes += 1;
        Ok(())
    }

    async fn create_note(
        &self,
        issue: &IssueRef,
        note: &NoteWrite,
        as_user: Option<&str>,
    ) -> ApiResult<String> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        Self::issue_mut(&mut state, issue)?.notes.push(FakeNote {
            id,
            body: note.body.clone(),
            author: as_user.map(str::to_string),
            created_at: note.created_at,
        });
        state.writes += 1;
        Ok(id.to_string())
    }

    async fn list_note_keys(&self, issue: &IssueRef) -> ApiResult<Vec<(String, String)>> {
        let mut state = self.state.lock().unwrap();
        let notes = &Self::issue_mut(&mut state, issue)?.notes;
        Ok(notes
            .iter()
            .filter_map(|n| parse_note_marker(&n.body).map(|m| (m.to_string(), n.id.to_string())))
            .collect())
    }

    async fn upload_attachment(
        &self,
        project: &str,
        filename: &str,
        _content: Vec<u8>,
        _as_user: Option<&str>,
    ) -> ApiResult<UploadedFile> {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let url = format!("https://gitlab.test/{project}/uploads/{id}/{filename}");
        state.uploads.push((filename.to_string(), url.clone()));
        state.writes += 1;
        Ok(UploadedFile { url })
    }

    async fn ensure_label(&self, project: &str, name: &str, color: &str) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = (project.to_string(), name.to_string());
        if state.labels.get(&key).map(String::as_str) != Some(color) {
            state.labels.insert(key, color.to_string());
            state.writes += 1;
        }
        Ok(())
    }

    async fn ensure_milestone(&self, project: &str, title: &str) -> ApiResult<u64> {
        let mut state = self.state.lock().unwrap();
        let key = (project.to_string(), title.to_string());
        if let Some(id) = state.milestones.get(&key) {
            return Ok(*id);
        }
        let id = state.next_id();
        state.milestones.insert(key, id);
        state.writes += 1;
        Ok(id)
    }

    async fn find_user(&self, username: &str) -> ApiResult<Option<DestUser>> {
        Ok(self.state.lock().unwrap().users.get(username).cloned())
    }

    async fn create_user(&self, user: &NewUser) -> ApiResult<DestUser> {
        let mut state = self.state.lock().unwrap();
        if state.users.contains_key(&user.username) {
            return Err(ApiError::Conflict {
                operation: format!("create user {}", user.username),
                message: "username taken".into(),
            });
        }
        let created = DestUser {
            id: 1000 + state.next_id(),
            username: user.username.clone(),
            is_admin: false,
        };
        state.users.insert(user.username.clone(), created.clone());
        state.writes += 1;
        Ok(created)
    }

    async fn set_admin(&self, user: &DestUser, admin: bool) -> ApiResult<DestUser> {
        if !admin && self.failing_revokes.contains(&user.username) {
            return Err(ApiError::Rejected {
                operation: format!("revoke admin of {}", user.username),
                status: 403,
                message: "forbidden".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        let stored = state
            .users
            .get_mut(&user.username)
            .ok_or_else(|| ApiError::NotFound {
                operation: format!("user {}", user.username),
            })?;
        stored.is_admin = admin;
        let updated = stored.clone();
        state.writes += 1;
        Ok(updated)
    }

    async fn create_link(
        &self,
        from: &IssueRef,
        to: &IssueRef,
        kind: DestLinkKind,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .links
            .insert((from.to_string(), to.to_string(), kind.as_str()))
        {
            state.writes += 1;
        }
        Ok(())
    }

    async fn execute_quick_action(
        &self,
        issue: &IssueRef,
        action: &QuickAction,
        _as_user: Option<&str>,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().unwrap();
        if let QuickAction::Duplicate { target } = action {
            Self::issue_mut(&mut state, issue)?.duplicate_of = Some(target.clone());
        }
        state.writes += 1;
        Ok(())
    }
}
