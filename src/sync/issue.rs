//! First pass: one issue with its attachments and notes.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info};
use uuid::Uuid;

use super::users::ActingUser;
use super::Engine;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::model::destination::{DestProject, IssueRef, IssueWrite, NoteDraft, NoteWrite};
use crate::model::source::SourceIssue;
use crate::state::EntityKind;
use crate::translate::{child_id, IssueContext};

pub const DEFAULT_LABEL_COLOR: &str = "#428BCA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IssueOutcome {
    Imported,
    Updated,
    AlreadySynced,
}

/// Stored name of an uploaded attachment.
fn upload_name(original: &str, keep: bool) -> String {
    if keep {
        return original.to_string();
    }
    let extension = Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    format!("{}{extension}", Uuid::new_v4().simple())
}

fn parse_ref(bound: &str) -> SyncResult<IssueRef> {
    bound
        .parse()
        .map_err(|e| SyncError::StateStore(format!("bad issue binding: {e}")))
}

impl Engine<'_> {
    pub(super) async fn sync_issue(
        &mut self,
        project: &DestProject,
        issue: &SourceIssue,
    ) -> SyncResult<IssueOutcome> {
        let path = project.path.as_str();
        let reporter = self.acting_user(issue.reporter.as_deref()).await?;
        let assignee = self.acting_user(issue.assignee.as_deref()).await?;
        let attachments = self.sync_attachments(path, issue).await?;

        let draft = self.translator.issue(
            issue,
            &IssueContext {
                attachments: attachments.clone(),
                reporter_fallback: reporter.is_fallback(),
            },
        );
        for label in &draft.labels {
            self.ensure_label(path, label).await?;
        }
        let milestone_id = match &draft.milestone {
            Some(title) => Some(self.ensure_milestone(path, title).await?),
            None => None,
        };
        let write = IssueWrite {
            natural_key: draft.natural_key,
            title: draft.title,
            description: draft.description,
            labels: draft.labels.into_iter().collect(),
            milestone_id,
            assignee_ids: assignee.id.into_iter().collect(),
            created_at: draft.created_at,
            closed: draft.closed,
            closed_at: draft.closed_at,
            weight: draft.weight,
        };

        let destination = self.destination;
        let (issue_ref, outcome) = match self.store.resolve(&issue.key, EntityKind::Issue) {
            Some(bound) => {
                let issue_ref = parse_ref(bound)?;
                self.retry
                    .run("update issue", || destination.update_issue(&issue_ref, &write))
                    .await?;
                (issue_ref, IssueOutcome::Updated)
            }
            None => {
                let write = &write;
                let sudo = reporter.sudo();
                // Looking up the natural key before every attempt keeps a
                // create that timed out, or a crash before `bind`, from
                // producing a second issue.
                let (issue_ref, created) = self
                    .retry
                    .run("create issue", || async move {
                        if let Some(found) =
                            destination.find_issue(path, &write.natural_key).await?
                        {
                            return Ok((found, false));
                        }
                        let created = destination.create_issue(path, write, sudo).await?;
                        Ok::<_, ApiError>((created, true))
                    })
                    .await?;
                self.store
                    .bind(&issue.key, EntityKind::Issue, &issue_ref.to_string())?;
                if !created {
                    info!(issue = %issue.key, %issue_ref, "adopting existing destination issue");
                    self.retry
                        .run("update issue", || destination.update_issue(&issue_ref, write))
                        .await?;
                }
                (issue_ref, IssueOutcome::Imported)
            }
        };

        self.sync_notes(issue, &issue_ref, &attachments).await?;
        self.store
            .touch(&issue.key, EntityKind::Issue, issue.updated_at)?;
        Ok(outcome)
    }

    async fn sync_attachments(
        &mut self,
        path: &str,
        issue: &SourceIssue,
    ) -> SyncResult<Vec<(String, String)>> {
        if !self.config.import.migrate_attachments {
            return Ok(Vec::new());
        }
        let mut uploaded = Vec::new();
        for attachment in &issue.attachments {
            let id = child_id(&issue.key, EntityKind::Attachment, &attachment.id);
            if let Some(url) = self.store.resolve(&id, EntityKind::Attachment) {
                uploaded.push((attachment.filename.clone(), url.to_string()));
                continue;
            }

            let author = self.acting_user(attachment.author.as_deref()).await?;
            let source = self.source;
            let destination = self.destination;
            let content = self
                .retry
                .run("download attachment", || source.download_attachment(attachment))
                .await?;
            let filename = upload_name(
                &attachment.filename,
                self.config.import.keep_attachment_filenames,
            );
            let sudo = author.sudo();
            let file = self
                .retry
                .run("upload attachment", || {
                    destination.upload_attachment(path, &filename, content.clone(), sudo)
                })
                .await?;
            debug!(issue = %issue.key, file = %attachment.filename, url = %file.url, "uploaded attachment");
            self.store.bind(&id, EntityKind::Attachment, &file.url)?;
            uploaded.push((attachment.filename.clone(), file.url));
        }
        Ok(uploaded)
    }

    async fn ensure_label(&mut self, path: &str, label: &str) -> SyncResult<()> {
        let key = (path.to_string(), label.to_string());
        if self.labels.contains(&key) {
            return Ok(());
        }
        let color = self
            .config
            .label_colors
            .get(label)
            .map_or(DEFAULT_LABEL_COLOR, String::as_str);
        let destination = self.destination;
        self.retry
            .run("ensure label", || destination.ensure_label(path, label, color))
            .await?;
        self.labels.insert(key);
        Ok(())
    }

    async fn ensure_milestone(&mut self, path: &str, title: &str) -> SyncResult<u64> {
        let key = (path.to_string(), title.to_string());
        if let Some(id) = self.milestones.get(&key) {
            return Ok(*id);
        }
        let destination = self.destination;
        let id = self
            .retry
            .run("ensure milestone", || destination.ensure_milestone(path, title))
            .await?;
        self.milestones.insert(key, id);
        Ok(id)
    }

    /// Create the comment, worklog and metadata notes that have no binding.
    async fn sync_notes(
        &mut self,
        issue: &SourceIssue,
        issue_ref: &IssueRef,
        attachments: &[(String, String)],
    ) -> SyncResult<()> {
        let mut missing: Vec<(EntityKind, NoteDraft, ActingUser)> = Vec::new();

        for comment in &issue.comments {
            let id = child_id(&issue.key, EntityKind::Comment, &comment.id);
            if self.store.resolve(&id, EntityKind::Comment).is_some() {
                continue;
            }
            let author = self.acting_user(comment.author.as_deref()).await?;
            let draft =
                self.translator
                    .comment(&issue.key, comment, author.is_fallback(), attachments);
            missing.push((EntityKind::Comment, draft, author));
        }

        if self.config.import.migrate_worklogs {
            for worklog in &issue.worklogs {
                let id = child_id(&issue.key, EntityKind::Worklog, &worklog.id);
                if self.store.resolve(&id, EntityKind::Worklog).is_some() {
                    continue;
                }
                let author = self.acting_user(worklog.author.as_deref()).await?;
                let draft = self.translator.worklog(&issue.key, worklog, attachments);
                missing.push((EntityKind::Worklog, draft, author));
            }
        }

        if let Some(draft) = self.translator.custom_fields(issue) {
            if self
                .store
                .resolve(&draft.source_id, EntityKind::Metadata)
                .is_none()
            {
                missing.push((EntityKind::Metadata, draft, ActingUser::default()));
            }
        }

        if missing.is_empty() {
            return Ok(());
        }

        let destination = self.destination;
        let existing: BTreeMap<String, String> = self
            .retry
            .run("list notes", || destination.list_note_keys(issue_ref))
            .await?
            .into_iter()
            .collect();

        for (kind, draft, author) in missing {
            let note_id = match existing.get(&draft.source_id) {
                Some(id) => {
                    debug!(note = %draft.source_id, "note already present");
                    id.clone()
                }
                None => {
                    let note = NoteWrite {
                        body: draft.render(),
                        created_at: draft.created_at,
                    };
                    let sudo = author.sudo();
                    self.retry
                        .run("create note", || destination.create_note(issue_ref, &note, sudo))
                        .await?
                }
            };
            self.store.bind(&draft.source_id, kind, &note_id)?;
        }
        Ok(())
    }
}
