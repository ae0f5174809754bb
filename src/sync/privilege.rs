//! Temporary admin rights for impersonated users.
//!
//! GitLab only keeps `created_at` on issues and notes written by an admin,
//! so impersonated users are promoted for the run. Every promotion is
//! journaled before it is made and every journaled promotion is undone at the
//! end of the run, or at the start of the next one after a crash.

use chrono::Utc;
use tracing::{info, warn};

use super::report::ManualAction;
use crate::error::{SyncError, SyncResult};
use crate::model::destination::DestUser;
use crate::providers::DestinationTracker;
use crate::retry::RetryPolicy;
use crate::state::{ElevationRecord, StateStore};

pub struct PrivilegeManager {
    admin_username: String,
}

impl PrivilegeManager {
    pub fn new(admin_username: &str) -> Self {
        Self {
            admin_username: admin_username.to_string(),
        }
    }

    /// Promote `user` unless it is already an admin or the import identity.
    pub async fn elevate(
        &self,
        destination: &dyn DestinationTracker,
        store: &mut StateStore,
        retry: &RetryPolicy,
        user: &DestUser,
    ) -> SyncResult<()> {
        if user.is_admin || user.username == self.admin_username {
            return Ok(());
        }
        if store.elevations().iter().any(|r| r.user_id == user.id) {
            return Ok(());
        }

        store.record_elevation(ElevationRecord {
            user_id: user.id,
            username: user.username.clone(),
            granted_at: Utc::now(),
        })?;
        let granted = retry
            .run("grant admin", || destination.set_admin(user, true))
            .await;
        match granted {
            Ok(_) => {
                info!(user = %user.username, "granted temporary admin rights");
                Ok(())
            }
            Err(err) => {
                // The grant may still have happened; the record stays so that
                // revocation is attempted anyway.
                warn!(user = %user.username, error = %err, "granting admin rights failed");
                Err(err.into())
            }
        }
    }

    /// Demote every recorded user. Never fails: a user that cannot be demoted
    /// keeps its record and is returned as a manual action.
    pub async fn revoke_all(
        &self,
        destination: &dyn DestinationTracker,
        store: &mut StateStore,
        retry: &RetryPolicy,
    ) -> Vec<ManualAction> {
        let mut manual = Vec::new();
        for record in store.elevations() {
            let user = DestUser {
                id: record.user_id,
                username: record.username.clone(),
                is_admin: true,
            };
            let revoked = retry
                .run("revoke admin", || destination.set_admin(&user, false))
                .await;
            match revoked {
                Ok(_) => {
                    info!(user = %record.username, "revoked temporary admin rights");
                    if let Err(err) = store.clear_elevation(record.user_id) {
                        warn!(user = %record.username, error = %err, "cannot record revocation");
                        manual.push(ManualAction {
                            user: record.username.clone(),
                            reason: format!("revoked, but the state store failed: {err}"),
                        });
                    }
                }
                Err(err) => {
                    warn!(user = %record.username, error = %err, "revoking admin rights failed");
                    let err = SyncError::PrivilegeRevocation {
                        user: record.username.clone(),
                        reason: err.to_string(),
                    };
                    manual.push(ManualAction {
                        user: record.username.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        manual
    }

    /// Undo promotions left behind by a run that did not reach its cleanup.
    pub async fn recover(
        &self,
        destination: &dyn DestinationTracker,
        store: &mut StateStore,
        retry: &RetryPolicy,
    ) -> Vec<ManualAction> {
        let leftovers = store.elevations().len();
        if leftovers == 0 {
            return Vec::new();
        }
        warn!(users = leftovers, "revoking admin rights left by a previous run");
        self.revoke_all(destination, store, retry).await
    }
}
