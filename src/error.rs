use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state::EntityKind;

/// Failure reported by a source or destination collaborator.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network failure, rate limiting or a 5xx answer. Worth retrying.
    #[error("{operation}: transient failure: {message}")]
    Transient { operation: String, message: String },

    #[error("{operation}: not found")]
    NotFound { operation: String },

    /// The object already exists on the other side.
    #[error("{operation}: conflict: {message}")]
    Conflict { operation: String, message: String },

    #[error("{operation}: rejected with status {status}: {message}")]
    Rejected {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("{operation}: unexpected response: {message}")]
    Decode { operation: String, message: String },
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient { .. })
    }

    /// Classify an HTTP status code returned by `operation`.
    pub fn from_status(operation: &str, status: u16, message: String) -> Self {
        let operation = operation.to_string();
        match status {
            404 => ApiError::NotFound { operation },
            409 => ApiError::Conflict { operation, message },
            429 | 500..=599 => ApiError::Transient { operation, message },
            _ => ApiError::Rejected {
                operation,
                status,
                message,
            },
        }
    }

    pub fn from_reqwest(operation: &str, err: reqwest::Error) -> Self {
        let operation = operation.to_string();
        if err.is_decode() {
            return ApiError::Decode {
                operation,
                message: err.to_string(),
            };
        }
        match err.status() {
            Some(status) => ApiError::from_status(&operation, status.as_u16(), err.to_string()),
            None => ApiError::Transient {
                operation,
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Collaborator(#[from] ApiError),

    #[error(
        "{kind} {source_id} is already bound to {existing}, refusing to bind it to {attempted}"
    )]
    DuplicateBinding {
        kind: EntityKind,
        source_id: String,
        existing: String,
        attempted: String,
    },

    #[error("cursor of project {project} is at {current}, refusing to move it back to {attempted}")]
    CursorRegression {
        project: String,
        current: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },

    #[error("state store: {0}")]
    StateStore(String),

    #[error("link {from} {kind} {to} cannot be resolved: {reason}")]
    UnresolvableLink {
        from: String,
        to: String,
        kind: String,
        reason: String,
        /// No later run can resolve it.
        permanent: bool,
    },

    #[error("source user {user} cannot be mapped: {reason}")]
    UserMapping { user: String, reason: String },

    #[error("could not revoke elevated rights of {user}: {reason}")]
    PrivilegeRevocation { user: String, reason: String },

    #[error("run interrupted")]
    Interrupted,

    #[error("configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Fatal errors abort the current project: continuing would put the
    /// resumability of the import at risk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::DuplicateBinding { .. }
                | SyncError::CursorRegression { .. }
                | SyncError::StateStore(_)
                | SyncError::Interrupted
                | SyncError::Config(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::StateStore(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::StateStore(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ApiError::from_status("op", 503, "down".into()).is_transient());
        assert!(ApiError::from_status("op", 429, "slow down".into()).is_transient());
        assert!(matches!(
            ApiError::from_status("op", 404, String::new()),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            ApiError::from_status("op", 409, String::new()),
            ApiError::Conflict { .. }
        ));
        assert!(matches!(
            ApiError::from_status("op", 403, String::new()),
            ApiError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn fatal_errors() {
        assert!(SyncError::StateStore("disk full".into()).is_fatal());
        assert!(SyncError::Interrupted.is_fatal());
        assert!(!SyncError::UserMapping {
            user: "bob".into(),
            reason: "unmapped".into()
        }
        .is_fatal());
        let transient = ApiError::Transient {
            operation: "create issue".into(),
            message: "timeout".into(),
        };
        assert!(!SyncError::from(transient).is_fatal());
    }
}
