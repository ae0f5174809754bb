//! Source users to destination identities.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::Engine;
use crate::config::AppConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::destination::DestUser;
use crate::providers::{DestinationTracker, SourceTracker};
use crate::retry::RetryPolicy;
use crate::state::EntityKind;

/// Why writes for a user go out under the import identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fallback {
    /// Configured (or previously bound) destination user is missing.
    Unmapped,
    /// No destination user and user creation is disabled.
    NotMigrated,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ActingUser {
    pub username: Option<String>,
    pub id: Option<u64>,
    pub fallback: Option<Fallback>,
}

impl ActingUser {
    /// The account behind the API token.
    fn import_identity() -> Self {
        Self::default()
    }

    fn fallback(reason: Fallback) -> Self {
        Self {
            fallback: Some(reason),
            ..Self::default()
        }
    }

    /// Username to impersonate, `None` for the import identity.
    pub fn sudo(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl Engine<'_> {
    /// Identity that writes on behalf of source user `name`.
    pub(super) async fn acting_user(&mut self, name: Option<&str>) -> SyncResult<ActingUser> {
        let Some(name) = name else {
            return Ok(ActingUser::import_identity());
        };
        let acting = match self.users.get(name) {
            Some(cached) => cached.clone(),
            None => {
                let resolved = self.resolve_user(name).await?;
                self.users.insert(name.to_string(), resolved.clone());
                resolved
            }
        };
        match acting.fallback {
            Some(Fallback::Unmapped) => {
                *self.report.unmapped_users.entry(name.to_string()).or_default() += 1;
            }
            Some(Fallback::NotMigrated) => {
                *self
                    .report
                    .users_not_migrated
                    .entry(name.to_string())
                    .or_default() += 1;
            }
            None => {}
        }
        Ok(acting)
    }

    async fn resolve_user(&mut self, name: &str) -> SyncResult<ActingUser> {
        let bound = self
            .store
            .resolve(name, EntityKind::User)
            .map(str::to_string);
        let configured = self.config.users.get(name);
        if let (Some(bound), Some(configured)) = (&bound, configured) {
            if bound != configured {
                warn!(user = name, %bound, %configured, "user already bound, ignoring new mapping");
            }
        }
        let explicit = bound.is_some() || configured.is_some();
        let target = bound
            .or_else(|| configured.cloned())
            .unwrap_or_else(|| name.to_string());

        let destination = self.destination;
        let found = self
            .retry
            .run("find user", || destination.find_user(&target))
            .await?;
        let user = match found {
            Some(user) => user,
            None if self.config.import.migrate_users => {
                match self.migrate_user(name, &target).await {
                    Ok(user) => user,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        warn!(user = name, error = %err, "cannot migrate user, writing as import identity");
                        return Ok(ActingUser::fallback(Fallback::Unmapped));
                    }
                }
            }
            None => {
                let err = SyncError::UserMapping {
                    user: name.to_string(),
                    reason: format!("no destination user {target}"),
                };
                debug!(error = %err, "writing as import identity");
                return Ok(ActingUser::fallback(if explicit {
                    Fallback::Unmapped
                } else {
                    Fallback::NotMigrated
                }));
            }
        };

        self.store.bind(name, EntityKind::User, &user.username)?;
        if self.config.import.elevate_users {
            self.privileges
                .elevate(self.destination, self.store, &self.retry, &user)
                .await?;
        }
        Ok(ActingUser {
            username: Some(user.username),
            id: Some(user.id),
            fallback: None,
        })
    }

    async fn migrate_user(&mut self, name: &str, username: &str) -> SyncResult<DestUser> {
        let source = self.source;
        let destination = self.destination;
        let details = self
            .retry
            .run("get source user", || source.get_user(name))
            .await?;
        let new_user =
            self.translator
                .user(&details, username, &self.config.import.new_user_password);
        let created = self
            .retry
            .run("create user", || destination.create_user(&new_user))
            .await?;
        info!(user = name, username = %created.username, "created destination user");
        Ok(created)
    }
}

/// How a source user would be written in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOverview {
    pub name: String,
    /// Destination username the user maps to.
    pub target: String,
    /// The mapping comes from the `users` table.
    pub configured: bool,
    pub exists: bool,
    /// Number of issues referring to the user.
    pub references: usize,
}

/// Every source user referenced by the configured projects, with the
/// destination account they map to.
pub async fn user_overview(
    source: &dyn SourceTracker,
    destination: &dyn DestinationTracker,
    config: &AppConfig,
    retry: &RetryPolicy,
) -> SyncResult<Vec<UserOverview>> {
    let mut references: BTreeMap<String, usize> = BTreeMap::new();
    for key in config.projects.keys() {
        let issues = retry
            .run("list issues", || source.list_issues(key, None))
            .await?;
        for issue in &issues {
            for user in issue.referenced_users() {
                *references.entry(user).or_default() += 1;
            }
        }
    }

    let mut overview = Vec::with_capacity(references.len());
    for (name, count) in references {
        let configured = config.users.get(&name);
        let target = configured.cloned().unwrap_or_else(|| name.clone());
        let exists = retry
            .run("find user", || destination.find_user(&target))
            .await?
            .is_some();
        overview.push(UserOverview {
            configured: configured.is_some(),
            name,
            target,
            exists,
            references: count,
        });
    }
    Ok(overview)
}
