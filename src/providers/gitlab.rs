use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{check_status, ApiResult, DestinationTracker};
use crate::config::GitLabConfig;
use crate::error::ApiError;
use crate::model::destination::{
    parse_note_marker, Capabilities, DestLinkKind, DestProject, DestUser, IssueRef, IssueWrite,
    NewUser, NoteWrite, QuickAction, UploadedFile,
};

/// License plans that come with typed issue links.
const TYPED_LINK_PLANS: &[&str] = &["starter", "premium", "ultimate", "silver", "gold"];

const PAGE_SIZE: u32 = 100;

pub struct GitLabDestination {
    base_url: String,
    api_url: String,
    token: String,
    premium: Option<bool>,
    client: reqwest::Client,
}

impl GitLabDestination {
    pub fn new(config: &GitLabConfig) -> Self {
        let base_url = config.url.trim_end_matches('/').to_string();
        Self {
            api_url: format!("{base_url}/api/v4"),
            base_url,
            token: config.token.clone(),
            premium: config.premium,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str, as_user: Option<&str>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.api_url))
            .header("PRIVATE-TOKEN", &self.token);
        match as_user {
            Some(user) => builder.header("Sudo", user),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> ApiResult<T> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(operation, e))?;
        let resp = check_status(operation, resp).await?;
        resp.json()
            .await
            .map_err(|e| ApiError::from_reqwest(operation, e))
    }

    async fn send_unit(&self, operation: &str, builder: RequestBuilder) -> ApiResult<()> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(operation, e))?;
        check_status(operation, resp).await?;
        Ok(())
    }

    async fn label(&self, project: &str, name: &str) -> ApiResult<Option<LabelResponse>> {
        let path = format!(
            "/projects/{}/labels?search={}&per_page={PAGE_SIZE}",
            encode(project),
            encode(name)
        );
        let labels: Vec<LabelResponse> = self
            .send("list labels", self.request(Method::GET, &path, None))
            .await?;
        Ok(labels.into_iter().find(|l| l.name == name))
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// JSON body shared by issue creation and update.
fn issue_payload(issue: &IssueWrite) -> Value {
    let mut body = json!({
        "title": issue.title,
        "description": issue.description,
        "labels": issue.labels.join(","),
        "assignee_ids": issue.assignee_ids,
        "milestone_id": issue.milestone_id,
    });
    if let Some(weight) = issue.weight {
        body["weight"] = json!(weight);
    }
    body
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Deserialize)]
struct ProjectResponse {
    id: u64,
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct NamespaceResponse {
    id: u64,
}

#[derive(Deserialize)]
struct IssueResponse {
    iid: u64,
    title: String,
    state: String,
}

#[derive(Deserialize)]
struct NoteResponse {
    id: u64,
    #[serde(default)]
    body: String,
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

#[derive(Deserialize)]
struct LabelResponse {
    id: u64,
    name: String,
    #[serde(default)]
    color: String,
}

#[derive(Deserialize)]
struct MilestoneResponse {
    id: u64,
    title: String,
}

#[derive(Deserialize)]
struct LicenseResponse {
    plan: Option<String>,
}

#[async_trait]
impl DestinationTracker for GitLabDestination {
    fn name(&self) -> &str {
        "GitLab"
    }

    async fn capabilities(&self) -> ApiResult<Capabilities> {
        if let Some(premium) = self.premium {
            return Ok(Capabilities {
                typed_links: premium,
            });
        }
        let license: Result<LicenseResponse, ApiError> = self
            .send("read license", self.request(Method::GET, "/license", None))
            .await;
        let typed_links = match license {
            Ok(license) => license
                .plan
                .is_some_and(|plan| TYPED_LINK_PLANS.contains(&plan.to_lowercase().as_str())),
            // Community editions have no license endpoint.
            Err(ApiError::NotFound { .. }) => false,
            Err(err) if err.is_transient() => return Err(err),
            Err(err) => {
                warn!(error = %err, "cannot read license, assuming untyped links");
                false
            }
        };
        Ok(Capabilities { typed_links })
    }

    async fn ensure_project(&self, path: &str) -> ApiResult<DestProject> {
        let found: ApiResult<ProjectResponse> = self
            .send(
                &format!("get project {path}"),
                self.request(Method::GET, &format!("/projects/{}", encode(path)), None),
            )
            .await;
        let project = match found {
            Ok(project) => project,
            Err(ApiError::NotFound { .. }) => {
                let (namespace, name) = path.rsplit_once('/').ok_or_else(|| ApiError::Rejected {
                    operation: format!("create project {path}"),
                    status: 400,
                    message: "project path has no namespace".into(),
                })?;
                let ns: NamespaceResponse = self
                    .send(
                        &format!("get namespace {namespace}"),
                        self.request(
                            Method::GET,
                            &format!("/namespaces/{}", encode(namespace)),
                            None,
                        ),
                    )
                    .await?;
                debug!(path, "creating destination project");
                self.send(
                    &format!("create project {path}"),
                    self.request(Method::POST, "/projects", None).json(&json!({
                        "name": name,
                        "path": name,
                        "namespace_id": ns.id,
                    })),
                )
                .await?
            }
            Err(err) => return Err(err),
        };
        Ok(DestProject {
            id: project.id,
            path: project.path_with_namespace,
        })
    }

    async fn find_issue(&self, project: &str, natural_key: &str) -> ApiResult<Option<IssueRef>> {
        let suffix = format!("[{natural_key}]");
        let path = format!(
            "/projects/{}/issues?in=title&search={}&scope=all&per_page={PAGE_SIZE}",
            encode(project),
            encode(&suffix)
        );
        let issues: Vec<IssueResponse> = self
            .send("find issue", self.request(Method::GET, &path, None))
            .await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.title.ends_with(&suffix))
            .map(|i| i.iid)
            .min()
            .map(|iid| IssueRef {
                project: project.to_string(),
                iid,
            }))
    }

    async fn create_issue(
        &self,
        project: &str,
        issue: &IssueWrite,
        as_user: Option<&str>,
    ) -> ApiResult<IssueRef> {
        let operation = format!("create issue {}", issue.natural_key);
        let mut body = issue_payload(issue);
        body["created_at"] = json!(timestamp(issue.created_at));
        let created: IssueResponse = self
            .send(
                &operation,
                self.request(
                    Method::POST,
                    &format!("/projects/{}/issues", encode(project)),
                    as_user,
                )
                .json(&body),
            )
            .await?;
        let issue_ref = IssueRef {
            project: project.to_string(),
            iid: created.iid,
        };
        if issue.closed {
            let mut close = json!({"state_event": "close"});
            if let Some(closed_at) = issue.closed_at {
                close["updated_at"] = json!(timestamp(closed_at));
            }
            self.send_unit(
                &operation,
                self.request(
                    Method::PUT,
                    &format!("/projects/{}/issues/{}", encode(project), created.iid),
                    as_user,
                )
                .json(&close),
            )
            .await?;
        }
        Ok(issue_ref)
    }

    async fn update_issue(&self, issue: &IssueRef, write: &IssueWrite) -> ApiResult<()> {
        let operation = format!("update issue {issue}");
        let path = format!("/projects/{}/issues/{}", encode(&issue.project), issue.iid);
        let current: IssueResponse = self
            .send(&operation, self.request(Method::GET, &path, None))
            .await?;
        let mut body = issue_payload(write);
        match (write.closed, current.state.as_str()) {
            (true, "opened") => body["state_event"] = json!("close"),
            (false, "closed") => body["state_event"] = json!("reopen"),
            _ => {}
        }
        self.send_unit(&operation, self.request(Method::PUT, &path, None).json(&body))
            .await
    }

    async fn create_note(
        &self,
        issue: &IssueRef,
        note: &NoteWrite,
        as_user: Option<&str>,
    ) -> ApiResult<String> {
        let mut body = json!({"body": note.body});
        if let Some(created_at) = note.created_at {
            body["created_at"] = json!(timestamp(created_at));
        }
        let created: NoteResponse = self
            .send(
                &format!("create note on {issue}"),
                self.request(
                    Method::POST,
                    &format!(
                        "/projects/{}/issues/{}/notes",
                        encode(&issue.project),
                        issue.iid
                    ),
                    as_user,
                )
                .json(&body),
            )
            .await?;
        Ok(created.id.to_string())
    }

    async fn list_note_keys(&self, issue: &IssueRef) -> ApiResult<Vec<(String, String)>> {
        let mut keys = Vec::new();
        let mut page = 1;
        loop {
            let path = format!(
                "/projects/{}/issues/{}/notes?per_page={PAGE_SIZE}&page={page}&sort=asc",
                encode(&issue.project),
                issue.iid
            );
            let notes: Vec<NoteResponse> = self
                .send(
                    &format!("list notes of {issue}"),
                    self.request(Method::GET, &path, None),
                )
                .await?;
            let fetched = notes.len();
            keys.extend(notes.into_iter().filter_map(|n| {
                parse_note_marker(&n.body).map(|marker| (marker.to_string(), n.id.to_string()))
            }));
            if fetched < PAGE_SIZE as usize {
                break;
            }
            page += 1;
        }
        Ok(keys)
    }

    async fn upload_attachment(
        &self,
        project: &str,
        filename: &str,
        content: Vec<u8>,
        as_user: Option<&str>,
    ) -> ApiResult<UploadedFile> {
        let operation = format!("upload {filename}");
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let uploaded: UploadResponse = self
            .send(
                &operation,
                self.request(
                    Method::POST,
                    &format!("/projects/{}/uploads", encode(project)),
                    as_user,
                )
                .multipart(form),
            )
            .await?;
        Ok(UploadedFile {
            url: format!("{}/{project}{}", self.base_url, uploaded.url),
        })
    }

    async fn ensure_label(&self, project: &str, name: &str, color: &str) -> ApiResult<()> {
        match self.label(project, name).await? {
            Some(label) if label.color.eq_ignore_ascii_case(color) => Ok(()),
            Some(label) => {
                self.send_unit(
                    &format!("recolor label {name}"),
                    self.request(
                        Method::PUT,
                        &format!("/projects/{}/labels/{}", encode(project), label.id),
                        None,
                    )
                    .json(&json!({"new_color": color})),
                )
                .await
            }
            None => {
                let created = self
                    .send_unit(
                        &format!("create label {name}"),
                        self.request(
                            Method::POST,
                            &format!("/projects/{}/labels", encode(project)),
                            None,
                        )
                        .json(&json!({"name": name, "color": color})),
                    )
                    .await;
                match created {
                    Err(ApiError::Conflict { .. }) => Ok(()),
                    other => other,
                }
            }
        }
    }

    async fn ensure_milestone(&self, project: &str, title: &str) -> ApiResult<u64> {
        let path = format!(
            "/projects/{}/milestones?title={}",
            encode(project),
            encode(title)
        );
        let existing: Vec<MilestoneResponse> = self
            .send("find milestone", self.request(Method::GET, &path, None))
            .await?;
        if let Some(milestone) = existing.into_iter().find(|m| m.title == title) {
            return Ok(milestone.id);
        }
        let created: MilestoneResponse = self
            .send(
                &format!("create milestone {title}"),
                self.request(
                    Method::POST,
                    &format!("/projects/{}/milestones", encode(project)),
                    None,
                )
                .json(&json!({"title": title})),
            )
            .await?;
        Ok(created.id)
    }

    async fn find_user(&self, username: &str) -> ApiResult<Option<DestUser>> {
        let users: Vec<DestUser> = self
            .send(
                &format!("find user {username}"),
                self.request(
                    Method::GET,
                    &format!("/users?username={}", encode(username)),
                    None,
                ),
            )
            .await?;
        Ok(users.into_iter().find(|u| u.username == username))
    }

    async fn create_user(&self, user: &NewUser) -> ApiResult<DestUser> {
        self.send(
            &format!("create user {}", user.username),
            self.request(Method::POST, "/users", None).json(&json!({
                "username": user.username,
                "name": user.name,
                "email": user.email,
                "password": user.password,
                "skip_confirmation": true,
            })),
        )
        .await
    }

    async fn set_admin(&self, user: &DestUser, admin: bool) -> ApiResult<DestUser> {
        self.send(
            &format!("set admin flag of {}", user.username),
            self.request(Method::PUT, &format!("/users/{}", user.id), None)
                .json(&json!({"admin": admin})),
        )
        .await
    }

    async fn create_link(
        &self,
        from: &IssueRef,
        to: &IssueRef,
        kind: DestLinkKind,
    ) -> ApiResult<()> {
        let operation = format!("link {from} {} {to}", kind.as_str());
        let result = self
            .send_unit(
                &operation,
                self.request(
                    Method::POST,
                    &format!("/projects/{}/issues/{}/links", encode(&from.project), from.iid),
                    None,
                )
                .json(&json!({
                    "target_project_id": to.project,
                    "target_issue_iid": to.iid,
                    "link_type": kind.as_str(),
                })),
            )
            .await;
        match result {
            Err(ApiError::Conflict { .. }) => {
                debug!(%from, %to, "link already exists");
                Ok(())
            }
            other => other,
        }
    }

    async fn execute_quick_action(
        &self,
        issue: &IssueRef,
        action: &QuickAction,
        as_user: Option<&str>,
    ) -> ApiResult<()> {
        // A note made only of quick actions is consumed by GitLab and not kept.
        self.send_unit(
            &format!("{} on {issue}", action.render()),
            self.request(
                Method::POST,
                &format!(
                    "/projects/{}/issues/{}/notes",
                    encode(&issue.project),
                    issue.iid
                ),
                as_user,
            )
            .json(&json!({"body": action.render()})),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn write() -> IssueWrite {
        IssueWrite {
            natural_key: "PROJ-42".into(),
            title: "Fix login bug [PROJ-42]".into(),
            description: "body".into(),
            labels: vec!["component:Backend".into(), "priority:High".into()],
            milestone_id: Some(3),
            assignee_ids: vec![],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
            closed: true,
            closed_at: None,
            weight: None,
        }
    }

    #[test]
    fn payload_joins_labels() {
        let body = issue_payload(&write());
        assert_eq!(body["labels"], "component:Backend,priority:High");
        assert_eq!(body["milestone_id"], 3);
        assert!(body.get("weight").is_none());
    }

    #[test]
    fn weight_is_sent_when_known() {
        let body = issue_payload(&IssueWrite {
            weight: Some(5),
            ..write()
        });
        assert_eq!(body["weight"], 5);
    }

    #[test]
    fn timestamps_are_utc_rfc3339() {
        assert_eq!(
            timestamp(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()),
            "2024-01-01T09:00:00.000Z"
        );
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let gitlab = GitLabDestination::new(&GitLabConfig {
            url: "https://gitlab.example.com/".into(),
            token: "t".into(),
            admin_username: "root".into(),
            premium: Some(true),
        });
        assert_eq!(gitlab.api_url, "https://gitlab.example.com/api/v4");
        assert_eq!(gitlab.base_url, "https://gitlab.example.com");
    }

    #[tokio::test]
    async fn configured_plan_overrides_license_lookup() {
        let gitlab = GitLabDestination::new(&GitLabConfig {
            url: "http://127.0.0.1:9".into(),
            token: "t".into(),
            admin_username: "root".into(),
            premium: Some(false),
        });
        let caps = gitlab.capabilities().await.unwrap();
        assert!(!caps.typed_links);
    }
}
