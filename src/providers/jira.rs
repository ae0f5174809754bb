use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{check_status, ApiResult, SourceTracker};
use crate::config::JiraConfig;
use crate::error::ApiError;
use crate::model::source::{
    Attachment, Comment, LinkKind, SourceIssue, SourceLink, SourceProject, SourceUser, Status,
    StatusCategory, Worklog,
};
use crate::util::adf::field_text;

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

pub struct JiraSource {
    base_url: String,
    auth_header: String,
    page_size: u32,
    epic_field: Option<String>,
    story_points_field: Option<String>,
    custom_fields: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl JiraSource {
    pub fn new(config: &JiraConfig) -> Self {
        let creds = format!("{}:{}", config.username, config.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_header: format!("Basic {encoded}"),
            page_size: config.page_size.max(1),
            epic_field: config.epic_field.clone(),
            story_points_field: config.story_points_field.clone(),
            custom_fields: config.custom_fields.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, operation: &str, url: &str) -> ApiResult<T> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(operation, e))?;
        let resp = check_status(operation, resp).await?;
        resp.json()
            .await
            .map_err(|e| ApiError::from_reqwest(operation, e))
    }

    async fn complete(&self, issue: JiraIssue) -> ApiResult<SourceIssue> {
        let mut issue = issue;
        if let Some(comments) = &issue.fields.comment {
            if comments.total > comments.comments.len() {
                let url = format!(
                    "{}/rest/api/2/issue/{}/comment?maxResults=1000",
                    self.base_url, issue.key
                );
                issue.fields.comment = Some(self.get("list comments", &url).await?);
            }
        }
        if let Some(worklogs) = &issue.fields.worklog {
            if worklogs.total > worklogs.worklogs.len() {
                let url = format!("{}/rest/api/2/issue/{}/worklog", self.base_url, issue.key);
                issue.fields.worklog = Some(self.get("list worklogs", &url).await?);
            }
        }
        self.convert(issue)
    }

    fn convert(&self, issue: JiraIssue) -> ApiResult<SourceIssue> {
        let operation = format!("decode issue {}", issue.key);
        let f = issue.fields;
        let date = |value: Option<&str>| -> ApiResult<Option<DateTime<Utc>>> {
            value.map(|v| parse_date(&operation, v)).transpose()
        };

        let created_at = date(f.created.as_deref())?.ok_or_else(|| ApiError::Decode {
            operation: operation.clone(),
            message: "missing created date".into(),
        })?;
        let updated_at = date(f.updated.as_deref())?.unwrap_or(created_at);

        let mut links = Vec::new();
        for link in f.issuelinks {
            if let Some(target) = link.outward_issue {
                links.push(SourceLink {
                    id: link.id,
                    kind: LinkKind::from_outward(&link.link_type.outward),
                    target: target.key,
                });
            }
        }

        let comments = f
            .comment
            .map(|c| c.comments)
            .unwrap_or_default()
            .into_iter()
            .map(|c| {
                Ok(Comment {
                    id: c.id,
                    author: c.author.and_then(UserField::identifier),
                    body: c.body.as_ref().and_then(field_text).unwrap_or_default(),
                    created_at: parse_date(&operation, &c.created)?,
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;

        let worklogs = f
            .worklog
            .map(|w| w.worklogs)
            .unwrap_or_default()
            .into_iter()
            .map(|w| {
                Ok(Worklog {
                    id: w.id,
                    author: w.author.and_then(UserField::identifier),
                    time_spent: w.time_spent,
                    started: parse_date(&operation, &w.started)?,
                    comment: w.comment.as_ref().and_then(field_text),
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;

        let attachments = f
            .attachment
            .into_iter()
            .map(|a| Attachment {
                id: a.id,
                filename: a.filename,
                author: a.author.and_then(UserField::identifier),
                content_url: a.content,
            })
            .collect();

        let epic = self
            .epic_field
            .as_ref()
            .and_then(|field| f.extra.get(field))
            .and_then(Value::as_str)
            .map(str::to_string);
        let story_points = self
            .story_points_field
            .as_ref()
            .and_then(|field| f.extra.get(field))
            .and_then(Value::as_f64);
        let custom_fields = self
            .custom_fields
            .iter()
            .filter_map(|(field, caption)| {
                f.extra
                    .get(field)
                    .and_then(render_value)
                    .map(|value| (caption.clone(), value))
            })
            .collect();

        Ok(SourceIssue {
            id: issue.id,
            key: issue.key,
            title: f.summary.unwrap_or_default(),
            body: f.description.as_ref().and_then(field_text),
            issue_type: f.issuetype.map(|t| t.name),
            status: f.status.map(|s| Status {
                category: s
                    .status_category
                    .map_or(StatusCategory::Undefined, |c| StatusCategory::from_key(&c.key)),
                name: s.name,
            }),
            resolution: f.resolution.map(|r| r.name),
            priority: f.priority.map(|p| p.name),
            components: f.components.into_iter().map(|c| c.name).collect(),
            labels: f.labels,
            fix_versions: f.fix_versions.into_iter().map(|v| v.name).collect(),
            reporter: f.reporter.and_then(UserField::identifier),
            assignee: f.assignee.and_then(UserField::identifier),
            created_at,
            updated_at,
            resolved_at: date(f.resolutiondate.as_deref())?,
            parent: f.parent.map(|p| p.key),
            subtasks: f.subtasks.into_iter().map(|s| s.key).collect(),
            epic,
            links,
            comments,
            attachments,
            worklogs,
            story_points,
            custom_fields,
        })
    }
}

fn parse_date(operation: &str, value: &str) -> ApiResult<DateTime<Utc>> {
    DateTime::parse_from_str(value, DATE_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ApiError::Decode {
            operation: operation.to_string(),
            message: format!("bad date {value:?}: {e}"),
        })
}

/// Display form of a custom field value.
fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(render_value).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        Value::Object(obj) => ["value", "name", "displayName"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| field_text(value)),
    }
}

/// JQL for the issues of `project`. The time filter is widened by a day
/// because JQL compares minutes in the server's time zone; exact filtering
/// happens on `updated_at` afterwards.
fn issues_jql(project: &str, since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => format!(
            "project = \"{project}\" AND updated >= \"{}\" ORDER BY updated ASC, key ASC",
            (since - Duration::days(1)).format("%Y-%m-%d %H:%M")
        ),
        None => format!("project = \"{project}\" ORDER BY updated ASC, key ASC"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    start_at: usize,
    total: usize,
    issues: Vec<JiraIssue>,
}

#[derive(Deserialize)]
struct JiraIssue {
    id: String,
    key: String,
    fields: IssueFields,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueFields {
    summary: Option<String>,
    description: Option<Value>,
    issuetype: Option<Named>,
    status: Option<StatusField>,
    resolution: Option<Named>,
    priority: Option<Named>,
    #[serde(default)]
    components: Vec<Named>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    fix_versions: Vec<Named>,
    reporter: Option<UserField>,
    assignee: Option<UserField>,
    created: Option<String>,
    updated: Option<String>,
    resolutiondate: Option<String>,
    parent: Option<KeyRef>,
    #[serde(default)]
    subtasks: Vec<KeyRef>,
    #[serde(default)]
    issuelinks: Vec<IssueLink>,
    comment: Option<CommentPage>,
    worklog: Option<WorklogPage>,
    #[serde(default)]
    attachment: Vec<AttachmentField>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

#[derive(Deserialize)]
struct KeyRef {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusField {
    name: String,
    status_category: Option<CategoryField>,
}

#[derive(Deserialize)]
struct CategoryField {
    key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserField {
    name: Option<String>,
    account_id: Option<String>,
    display_name: Option<String>,
    email_address: Option<String>,
}

impl UserField {
    /// Server installations name users, Cloud only has account ids.
    fn identifier(self) -> Option<String> {
        self.name.or(self.account_id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueLink {
    id: String,
    #[serde(rename = "type")]
    link_type: LinkType,
    outward_issue: Option<KeyRef>,
}

#[derive(Deserialize)]
struct LinkType {
    outward: String,
}

#[derive(Deserialize)]
struct CommentPage {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    comments: Vec<CommentField>,
}

#[derive(Deserialize)]
struct CommentField {
    id: String,
    author: Option<UserField>,
    body: Option<Value>,
    created: String,
}

#[derive(Deserialize)]
struct WorklogPage {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    worklogs: Vec<WorklogField>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorklogField {
    id: String,
    author: Option<UserField>,
    time_spent: String,
    started: String,
    comment: Option<Value>,
}

#[derive(Deserialize)]
struct AttachmentField {
    id: String,
    filename: String,
    author: Option<UserField>,
    content: String,
}

#[derive(Deserialize)]
struct ProjectField {
    key: String,
    name: String,
}

#[async_trait]
impl SourceTracker for JiraSource {
    fn name(&self) -> &str {
        "Jira"
    }

    async fn list_projects(&self) -> ApiResult<Vec<SourceProject>> {
        let url = format!("{}/rest/api/2/project", self.base_url);
        let projects: Vec<ProjectField> = self.get("list projects", &url).await?;
        Ok(projects
            .into_iter()
            .map(|p| SourceProject {
                key: p.key,
                name: p.name,
            })
            .collect())
    }

    async fn list_issues(
        &self,
        project: &str,
        since: Option<DateTime<Utc>>,
    ) -> ApiResult<Vec<SourceIssue>> {
        let jql = issues_jql(project, since);
        let mut issues = Vec::new();
        let mut start_at = 0;
        loop {
            let url = format!(
                "{}/rest/api/2/search?jql={}&startAt={start_at}&maxResults={}&fields=*all",
                self.base_url,
                urlencoding::encode(&jql),
                self.page_size
            );
            let page: SearchResponse = self.get("search issues", &url).await?;
            let fetched = page.issues.len();
            debug!(project, start_at = page.start_at, fetched, total = page.total, "fetched issue page");
            for issue in page.issues {
                issues.push(self.complete(issue).await?);
            }
            start_at = page.start_at + fetched;
            if fetched == 0 || start_at >= page.total {
                break;
            }
        }
        Ok(issues)
    }

    async fn get_issue(&self, key: &str) -> ApiResult<SourceIssue> {
        let url = format!("{}/rest/api/2/issue/{key}?fields=*all", self.base_url);
        let issue: JiraIssue = self.get(&format!("get issue {key}"), &url).await?;
        self.complete(issue).await
    }

    async fn get_user(&self, name: &str) -> ApiResult<SourceUser> {
        let url = format!(
            "{}/rest/api/2/user?username={}",
            self.base_url,
            urlencoding::encode(name)
        );
        let user: UserField = self.get(&format!("get user {name}"), &url).await?;
        Ok(SourceUser {
            name: name.to_string(),
            display_name: user.display_name.unwrap_or_else(|| name.to_string()),
            email: user.email_address,
        })
    }

    async fn download_attachment(&self, attachment: &Attachment) -> ApiResult<Vec<u8>> {
        let operation = format!("download attachment {}", attachment.filename);
        let resp = self
            .client
            .get(&attachment.content_url)
            .header("Authorization", &self.auth_header)
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&operation, e))?;
        let resp = check_status(&operation, resp).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ApiError::from_reqwest(&operation, e))?;
        Ok(bytes.to_vec())
    }
}
