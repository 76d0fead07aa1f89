// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for slipway-orchestrator.

use slipway_core::CoreError;
use thiserror::Error;

use crate::collaborators::CollaboratorError;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (`Context`, `ContextVersion`, `Instance`, ...).
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },

    /// The record is not in a state that allows the operation.
    #[error("Incorrect state: {0}")]
    IncorrectState(String),

    /// A uniqueness rule rejected the write (duplicate instance name, second master).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Placement service or container runtime failed; worth retrying.
    #[error("Transient infrastructure error: {0}")]
    TransientInfrastructure(String),

    /// A job payload was malformed.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// A collaborator refused the request outright.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Resource graph store failed.
    #[error("Store error: {0}")]
    Store(CoreError),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// JSON serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Taxonomy name, used in logs and dead-letter records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::IncorrectState(_) => "incorrect_state",
            Self::Conflict(_) => "conflict",
            Self::TransientInfrastructure(_) => "transient_infrastructure",
            Self::Validation(_) => "validation",
            Self::Rejected(_) => "rejected",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
        }
    }

    /// Whether redelivering the job could succeed.
    ///
    /// Infrastructure and database failures are retried; everything else is a
    /// logic or input problem and is dead-lettered.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientInfrastructure(_) => true,
            Self::Store(err) => !matches!(err, CoreError::CorruptRecord { .. }),
            _ => false,
        }
    }
}

impl From<CoreError> for Error {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Conflict { resource, details } => {
                Self::Conflict(format!("{}: {}", resource, details))
            }
            other => Self::Store(other),
        }
    }
}

impl From<CollaboratorError> for Error {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Unavailable(msg) => Self::TransientInfrastructure(msg),
            CollaboratorError::Rejected(msg) => Self::Rejected(msg),
        }
    }
}

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::TransientInfrastructure("dock down".into()).is_retryable());
        assert!(
            Error::from(CoreError::DatabaseError {
                operation: "query".into(),
                details: "connection reset".into(),
            })
            .is_retryable()
        );

        assert!(!Error::not_found("Instance", "i-1").is_retryable());
        assert!(!Error::IncorrectState("already started".into()).is_retryable());
        assert!(!Error::Validation("missing label".into()).is_retryable());
        assert!(!Error::Rejected("bad image".into()).is_retryable());
    }

    #[test]
    fn test_core_conflict_becomes_conflict() {
        let err = Error::from(CoreError::Conflict {
            resource: "instance".into(),
            details: "UNIQUE constraint failed: instances.owner_github_id, instances.lower_name"
                .into(),
        });
        assert_eq!(err.kind(), "conflict");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_collaborator_errors_map_to_taxonomy() {
        let err = Error::from(CollaboratorError::Unavailable("timeout".into()));
        assert_eq!(err.kind(), "transient_infrastructure");
        let err = Error::from(CollaboratorError::Rejected("no such image".into()));
        assert_eq!(err.kind(), "rejected");
    }

    #[test]
    fn test_not_found_display() {
        let err = Error::not_found("ContextVersion", "cv-9");
        assert_eq!(err.to_string(), "ContextVersion not found: cv-9");
    }
}
