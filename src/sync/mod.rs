//! The incremental import run.
//!
//! Pass 1 walks the changed issues of each project in `updated_at` order and
//! writes them with their attachments and notes. Pass 2 turns the collected
//! relations into destination links once both ends exist. Links into a
//! mapped project that has not been processed yet wait for a final pass after
//! the last project.

pub mod changes;
mod issue;
mod links;
pub mod privilege;
pub mod report;
mod users;


use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use chrono::{DateTime, Utc};

use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::destination::Capabilities;
use crate::model::source::project_of;
use crate::providers::{DestinationTracker, SourceTracker};
use crate::retry::RetryPolicy;
use crate::state::StateStore;
use crate::translate::{pending_links, PendingLink, TranslateConfig, Translator};

use changes::ChangeClass;
use issue::IssueOutcome;
use privilege::PrivilegeManager;
use report::{ProjectSummary, RunReport};
use users::ActingUser;

pub use users::{user_overview, UserOverview};

/// Everything a run works with. Nothing is global.
pub struct RunContext<'a> {
    pub source: &'a dyn SourceTracker,
    pub destination: &'a dyn DestinationTracker,
    pub store: &'a mut StateStore,
    pub config: &'a AppConfig,
    pub retry: RetryPolicy,
}

/// Import every mapped project, stopping early when `shutdown` completes.
/// Temporary admin rights are revoked whatever happened.
pub async fn run<F>(ctx: RunContext<'_>, shutdown: F) -> RunReport
where
    F: Future<Output = ()>,
{
    let mut engine = Engine::new(ctx);
    tokio::pin!(shutdown);

    let interrupted = tokio::select! {
        biased;
        _ = &mut shutdown => true,
        _ = engine.sync_all() => false,
    };
    if interrupted {
        warn!("run interrupted, cleaning up");
        engine.report.interrupted = true;
        if let Some(key) = engine.current.take() {
            engine.tally(&key, |s| s.aborted = Some(SyncError::Interrupted.to_string()));
        }
    }

    let manual = engine
        .privileges
        .revoke_all(engine.destination, engine.store, &engine.retry)
        .await;
    engine.report.manual_actions.extend(manual);
    engine.report
}

/// Cursor of a project with links that wait for a later project. It moves
/// past the owning issues only once those links exist.
struct HeldCursor {
    project: String,
    /// `(issue key, updated_at)` in processing order.
    order: Vec<(String, DateTime<Utc>)>,
    failed: BTreeSet<String>,
}

/// `updated_at` of the last issue in the longest prefix of `order` that went
/// through completely.
fn reached(order: &[(String, DateTime<Utc>)], failed: &BTreeSet<String>) -> Option<DateTime<Utc>> {
    order
        .iter()
        .take_while(|(key, _)| !failed.contains(key))
        .last()
        .map(|(_, at)| *at)
}

pub(crate) struct Engine<'a> {
    source: &'a dyn SourceTracker,
    destination: &'a dyn DestinationTracker,
    store: &'a mut StateStore,
    config: &'a AppConfig,
    retry: RetryPolicy,
    translator: Translator,
    capabilities: Capabilities,
    privileges: PrivilegeManager,
    /// Source user name -> identity used for writes on its behalf.
    users: BTreeMap<String, ActingUser>,
    labels: BTreeSet<(String, String)>,
    milestones: BTreeMap<(String, String), u64>,
    /// Projects whose first pass has started in this run.
    processed: BTreeSet<String>,
    /// Project being worked on.
    current: Option<String>,
    /// Project keys the source knows, when it could list them.
    known_projects: Option<BTreeSet<String>>,
    /// `(owning issue, link)` waiting for a project processed later.
    deferred: Vec<(String, PendingLink)>,
    held: Vec<HeldCursor>,
    report: RunReport,
}

impl<'a> Engine<'a> {
    fn new(ctx: RunContext<'a>) -> Self {
        Self {
            source: ctx.source,
            destination: ctx.destination,
            translator: Translator::new(TranslateConfig::from_app(ctx.config)),
            privileges: PrivilegeManager::new(&ctx.config.gitlab.admin_username),
            store: ctx.store,
            config: ctx.config,
            retry: ctx.retry,
            capabilities: Capabilities::default(),
            users: BTreeMap::new(),
            labels: BTreeSet::new(),
            milestones: BTreeMap::new(),
            processed: BTreeSet::new(),
            current: None,
            known_projects: None,
            deferred: Vec::new(),
            held: Vec::new(),
            report: RunReport::default(),
        }
    }

    fn tally(&mut self, project: &str, update: impl FnOnce(&mut ProjectSummary)) {
        if let Some(summary) = self.report.project_mut(project) {
            update(summary);
        }
    }

    async fn sync_all(&mut self) {
        let leftovers = self
            .privileges
            .recover(self.destination, self.store, &self.retry)
            .await;
        for action in &leftovers {
            warn!(user = %action.user, reason = %action.reason, "earlier admin grant still in place");
        }

        let destination = self.destination;
        match self
            .retry
            .run("query capabilities", || destination.capabilities())
            .await
        {
            Ok(capabilities) => self.capabilities = capabilities,
            Err(err) => {
                error!(error = %err, "cannot query destination capabilities");
                for (key, path) in &self.config.projects {
                    let mut summary = ProjectSummary::new(key, path);
                    summary.aborted = Some(err.to_string());
                    self.report.projects.push(summary);
                }
                return;
            }
        }
        let source = self.source;
        match self
            .retry
            .run("list projects", || source.list_projects())
            .await
        {
            Ok(projects) => {
                self.known_projects = Some(projects.into_iter().map(|p| p.key).collect());
            }
            Err(err) => warn!(error = %err, "cannot list source projects"),
        }
        info!(
            source = source.name(),
            destination = destination.name(),
            typed_links = self.capabilities.typed_links,
            projects = self.config.projects.len(),
            "starting import"
        );

        let config = self.config;
        for (key, path) in &config.projects {
            self.report.projects.push(ProjectSummary::new(key, path));
            self.current = Some(key.clone());
            if let Err(err) = self.sync_project(key, path).await {
                error!(project = %key, error = %err, "project aborted");
                self.tally(key, |s| s.aborted = Some(err.to_string()));
            }
            self.current = None;
        }

        let unlinked = self.resolve_deferred().await;
        self.release_cursors(&unlinked);
    }

    fn advance_cursor(&mut self, project: &str, at: DateTime<Utc>) -> SyncResult<()> {
        if self.store.cursor(project).map_or(true, |current| at > current) {
            self.store.advance(project, at)?;
            info!(project, cursor = %at, "advanced cursor");
        }
        Ok(())
    }

    /// Move the held cursors once the cross-project links are settled.
    fn release_cursors(&mut self, unlinked: &BTreeSet<String>) {
        for held in std::mem::take(&mut self.held) {
            let mut failed = held.failed;
            failed.extend(unlinked.iter().cloned());
            let Some(at) = reached(&held.order, &failed) else {
                continue;
            };
            if let Err(err) = self.advance_cursor(&held.project, at) {
                error!(project = %held.project, error = %err, "cannot advance cursor");
                self.tally(&held.project, |s| s.aborted = Some(err.to_string()));
            }
        }
    }

    async fn sync_project(&mut self, key: &str, path: &str) -> SyncResult<()> {
        self.processed.insert(key.to_string());
        if let Some(known) = &self.known_projects {
            if !known.contains(key) {
                return Err(SyncError::Config(format!(
                    "Jira project {key} does not exist or is not visible"
                )));
            }
        }

        let destination = self.destination;
        let source = self.source;
        let project = self
            .retry
            .run("ensure project", || destination.ensure_project(path))
            .await?;

        let cursor = self.store.cursor(key);
        let since = if self.config.import.full_scan {
            None
        } else {
            cursor
        };
        let issues = self
            .retry
            .run("list issues", || source.list_issues(key, since))
            .await?;
        let selection = changes::select(&issues, self.store, cursor);
        info!(
            project = key,
            listed = issues.len(),
            selected = selection.len(),
            cursor = ?cursor,
            "scanned project"
        );

        let mut pending: Vec<(String, PendingLink)> = Vec::new();
        let mut failed: BTreeSet<String> = BTreeSet::new();
        for selected in &selection {
            let issue = selected.issue;
            let outcome = match selected.class {
                ChangeClass::AlreadySynced => Ok(IssueOutcome::AlreadySynced),
                ChangeClass::New | ChangeClass::Changed => self.sync_issue(&project, issue).await,
            };
            match outcome {
                Ok(outcome) => {
                    info!(issue = %issue.key, ?outcome, "issue synced");
                    self.tally(key, |s| match outcome {
                        IssueOutcome::Imported => s.imported += 1,
                        IssueOutcome::Updated => s.updated += 1,
                        IssueOutcome::AlreadySynced => s.already_synced += 1,
                    });
                    for link in pending_links(issue) {
                        pending.push((issue.key.clone(), link));
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(issue = %issue.key, error = %err, "issue failed");
                    failed.insert(issue.key.clone());
                    self.tally(key, |s| s.failed.push((issue.key.clone(), err.to_string())));
                }
            }
        }

        let link_failures = self.resolve_links(key, pending).await?;
        failed.extend(link_failures);

        let order: Vec<(String, DateTime<Utc>)> = selection
            .iter()
            .map(|s| (s.issue.key.clone(), s.issue.updated_at))
            .collect();
        let waiting: BTreeSet<String> = self
            .deferred
            .iter()
            .filter(|(owner, _)| project_of(owner) == key)
            .map(|(owner, _)| owner.clone())
            .collect();
        let mut blocked = failed.clone();
        blocked.extend(waiting.iter().cloned());
        if let Some(at) = reached(&order, &blocked) {
            self.advance_cursor(key, at)?;
        }
        if !waiting.is_empty() {
            debug!(project = key, issues = waiting.len(), "holding cursor for cross-project links");
            self.held.push(HeldCursor {
                project: key.to_string(),
                order,
                failed,
            });
        }

        for (label, color) in &self.config.label_colors {
            let applied = self
                .retry
                .run("color label", || destination.ensure_label(path, label, color))
                .await;
            if let Err(err) = applied {
                warn!(label = %label, error = %err, "cannot apply label color");
            }
        }
        Ok(())
    }
}
