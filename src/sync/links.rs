//! Second pass: source relations to destination links.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::Engine;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::model::destination::{IssueRef, QuickAction};
use crate::model::source::project_of;
use crate::state::EntityKind;
use crate::translate::{link_plan, LinkPlan, PendingLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkOutcome {
    Created,
    /// Already bound, or nothing to create for this kind.
    Skipped,
    /// An endpoint belongs to a mapped project processed later in the run.
    Deferred,
    Unsupported,
}

impl Engine<'_> {
    /// Materialise the links collected for `project`. Returns the keys of the
    /// issues whose links failed for a reason worth retrying.
    pub(super) async fn resolve_links(
        &mut self,
        project: &str,
        pending: Vec<(String, PendingLink)>,
    ) -> SyncResult<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut failed = BTreeSet::new();
        for (owner, link) in pending {
            if !seen.insert(link.id.clone()) {
                continue;
            }
            match self.materialise(&link).await {
                Ok(LinkOutcome::Created) => self.tally(project, |s| s.links_created += 1),
                Ok(LinkOutcome::Skipped) => {}
                Ok(LinkOutcome::Deferred) => {
                    debug!(link = %link.id, "deferring link to a later project");
                    self.deferred.push((owner, link));
                }
                Ok(LinkOutcome::Unsupported) => self.report.unsupported_links.push(describe(&link)),
                Err(err @ SyncError::UnresolvableLink { permanent, .. }) => {
                    warn!(error = %err, "unresolved link");
                    self.report.unresolved_links.push(err.to_string());
                    // The missing endpoint is retried by the next run.
                    if !permanent {
                        failed.insert(owner);
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(link = %link.id, error = %err, "link failed");
                    self.report
                        .failed_links
                        .push(format!("{}: {err}", describe(&link)));
                    failed.insert(owner);
                }
            }
        }
        Ok(failed)
    }

    /// Links that waited for projects processed later in the run. Returns the
    /// owning issues whose links could not be created.
    pub(super) async fn resolve_deferred(&mut self) -> BTreeSet<String> {
        let deferred = std::mem::take(&mut self.deferred);
        let mut unlinked = BTreeSet::new();
        if deferred.is_empty() {
            return unlinked;
        }
        info!(links = deferred.len(), "resolving cross-project links");
        for (owner, link) in deferred {
            match self.materialise(&link).await {
                Ok(LinkOutcome::Created) => {
                    self.tally(project_of(&owner), |s| s.links_created += 1);
                    continue;
                }
                Ok(LinkOutcome::Skipped) => continue,
                Ok(LinkOutcome::Unsupported) => {
                    self.report.unsupported_links.push(describe(&link));
                    continue;
                }
                // A project that aborted before its first pass.
                Ok(LinkOutcome::Deferred) => self
                    .report
                    .unresolved_links
                    .push(format!("{}: target project was not processed", describe(&link))),
                Err(err @ SyncError::UnresolvableLink { permanent, .. }) => {
                    warn!(error = %err, "unresolved link");
                    self.report.unresolved_links.push(err.to_string());
                    if permanent {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(link = %link.id, error = %err, "link failed");
                    self.report
                        .failed_links
                        .push(format!("{}: {err}", describe(&link)));
                }
            }
            unlinked.insert(owner);
        }
        unlinked
    }

    async fn materialise(&mut self, link: &PendingLink) -> SyncResult<LinkOutcome> {
        if self.store.resolve(&link.id, EntityKind::Link).is_some() {
            return Ok(LinkOutcome::Skipped);
        }
        let plan = link_plan(&link.kind, self.capabilities);
        match plan {
            LinkPlan::Skip => return Ok(LinkOutcome::Skipped),
            LinkPlan::Unsupported => return Ok(LinkOutcome::Unsupported),
            LinkPlan::Link(_) | LinkPlan::MarkDuplicate => {}
        }

        let from = self.endpoint(link, &link.from).await?;
        let to = self.endpoint(link, &link.to).await?;
        let (Some(from), Some(to)) = (from, to) else {
            return Ok(LinkOutcome::Deferred);
        };

        let destination = self.destination;
        let created = if let LinkPlan::Link(kind) = plan {
            self.retry
                .run("create link", || destination.create_link(&from, &to, kind))
                .await?;
            format!("{from} {} {to}", kind.as_str())
        } else {
            let action = QuickAction::Duplicate { target: to.clone() };
            self.retry
                .run("mark duplicate", || {
                    destination.execute_quick_action(&from, &action, None)
                })
                .await?;
            format!("{from} duplicate of {to}")
        };
        self.store.bind(&link.id, EntityKind::Link, &created)?;
        debug!(link = %link.id, %created, "created link");
        Ok(LinkOutcome::Created)
    }

    /// Destination issue of `key`, `None` when it may still appear later in
    /// the run.
    async fn endpoint(&self, link: &PendingLink, key: &str) -> SyncResult<Option<IssueRef>> {
        if let Some(bound) = self.store.resolve(key, EntityKind::Issue) {
            let issue_ref = bound
                .parse()
                .map_err(|e| SyncError::StateStore(format!("bad issue binding: {e}")))?;
            return Ok(Some(issue_ref));
        }
        let project = project_of(key);
        let unresolvable = |reason: String, permanent: bool| SyncError::UnresolvableLink {
            from: link.from.clone(),
            to: link.to.clone(),
            kind: link.kind.to_string(),
            reason,
            permanent,
        };
        if !self.config.projects.contains_key(project) {
            return Err(unresolvable(
                format!("{key} is outside the imported projects"),
                true,
            ));
        }
        if !self.processed.contains(project) {
            return Ok(None);
        }

        // Deleted or moved issues never show up again.
        let source = self.source;
        match self.retry.run("get issue", || source.get_issue(key)).await {
            Ok(_) => Err(unresolvable(format!("{key} was not imported"), false)),
            Err(ApiError::NotFound { .. }) => Err(unresolvable(
                format!("{key} does not exist in Jira"),
                true,
            )),
            Err(err) => Err(err.into()),
        }
    }
}

fn describe(link: &PendingLink) -> String {
    format!("{} {} {}", link.from, link.kind, link.to)
}
