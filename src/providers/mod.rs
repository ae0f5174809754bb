pub mod gitlab;
pub mod jira;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::model::destination::{
    Capabilities, DestLinkKind, DestProject, DestUser, IssueRef, IssueWrite, NewUser, NoteWrite,
    QuickAction, UploadedFile,
};
use crate::model::source::{Attachment, SourceIssue, SourceProject, SourceUser};

pub type ApiResult<T> = Result<T, ApiError>;

/// Read access to the tracker issues are imported from.
#[async_trait]
pub trait SourceTracker: Send + Sync {
    fn name(&self) -> &str;

    async fn list_projects(&self) -> ApiResult<Vec<SourceProject>>;

    /// Issues of `project`, all of them or only those updated at or after
    /// `since`, ordered by `updated_at` ascending.
    async fn list_issues(
        &self,
        project: &str,
        since: Option<DateTime<Utc>>,
    ) -> ApiResult<Vec<SourceIssue>>;

    async fn get_issue(&self, key: &str) -> ApiResult<SourceIssue>;

    async fn get_user(&self, name: &str) -> ApiResult<SourceUser>;

    async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Vec<u8>>;
}

/// Write access to the tracker issues are imported into.
///
/// Calls taking `as_user` perform the write impersonating that user; `None`
/// writes as the configured admin.
#[async_trait]
pub trait DestinationTracker: Send + Sync {
    fn name(&self) -> &str;

    async fn capabilities(&self) -> ApiResult<Capabilities>;

    async fn ensure_project(&self, path: &str) -> ApiResult<DestProject>;

    /// Issue whose title carries `natural_key`, if one exists.
    async fn find_issue(&self, project: &str, natural_key: &str) -> ApiResult<Option<IssueRef>>;

    async fn create_issue(
        &self,
        project: &str,
        issue: &IssueWrite,
        as_user: Option<&str>,
    ) -> ApiResult<IssueRef>;

    async fn update_issue(&self, issue: &IssueRef, write: &IssueWrite) -> ApiResult<()>;

    /// Returns the id of the new note.
    async fn create_note(
        &self,
        issue: &IssueRef,
        note: &NoteWrite,
        as_user: Option<&str>,
    ) -> ApiResult<String>;

    /// `(marker, note id)` of every note on `issue` that carries an import marker.
    async fn list_note_keys(&self, issue: &IssueRef) -> ApiResult<Vec<(String, String)>>;

    async fn upload_attachment(
        &self,
        project: &str,
        filename: &str,
        content: Vec<u8>,
        as_user: Option<&str>,
    ) -> ApiResult<UploadedFile>;

    async fn ensure_label(&self, project: &str, name: &str, color: &str) -> ApiResult<()>;

    /// Id of the milestone titled `title`, created if missing.
    async fn ensure_milestone(&self, project: &str, title: &str) -> ApiResult<u64>;

    async fn find_user(&self, username: &str) -> ApiResult<Option<DestUser>>;

    async fn create_user(&self, user: &NewUser) -> ApiResult<DestUser>;

    async fn set_admin(&self, user: &DestUser, admin: bool) -> ApiResult<DestUser>;

    /// An already existing identical link counts as success.
    async fn create_link(
        &self,
        from: &IssueRef,
        to: &IssueRef,
        kind: DestLinkKind,
    ) -> ApiResult<()>;

    async fn execute_quick_action(
        &self,
        issue: &IssueRef,
        action: &QuickAction,
        as_user: Option<&str>,
    ) -> ApiResult<()>;
}

pub fn create_source(config: &AppConfig) -> Box<dyn SourceTracker> {
    Box::new(jira::JiraSource::new(&config.jira))
}

pub fn create_destination(config: &AppConfig) -> Box<dyn DestinationTracker> {
    Box::new(gitlab::GitLabDestination::new(&config.gitlab))
}

/// Map a non-success response to an [`ApiError`], keeping the body as message.
pub(crate) async fn check_status(
    operation: &str,
    resp: reqwest::Response,
) -> ApiResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message: String = body.chars().take(500).collect();
    Err(ApiError::from_status(operation, status.as_u16(), message))
}
