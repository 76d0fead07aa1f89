// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for slipway-core.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the resource graph store.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A uniqueness constraint rejected the write (duplicate name, second master, ...).
    Conflict {
        /// The record kind being written.
        resource: String,
        /// Constraint details.
        details: String,
    },

    /// A stored value could not be decoded into its record type.
    CorruptRecord {
        /// The record kind.
        resource: String,
        /// The record id.
        id: String,
        /// What was wrong.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "CONFLICT",
            Self::CorruptRecord { .. } => "CORRUPT_RECORD",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    pub(crate) fn corrupt(resource: &str, id: &str, details: impl fmt::Display) -> Self {
        Self::CorruptRecord {
            resource: resource.to_string(),
            id: id.to_string(),
            details: details.to_string(),
        }
    }

    /// Map a write error, turning unique violations into [`CoreError::Conflict`].
    pub(crate) fn from_write(resource: &str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err
            && db_err.is_unique_violation()
        {
            return Self::Conflict {
                resource: resource.to_string(),
                details: db_err.message().to_string(),
            };
        }
        err.into()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { resource, details } => {
                write!(f, "Conflicting {} write: {}", resource, details)
            }
            Self::CorruptRecord {
                resource,
                id,
                details,
            } => {
                write!(f, "Stored {} '{}' is unreadable: {}", resource, id, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                CoreError::Conflict {
                    resource: "instance".to_string(),
                    details: "UNIQUE constraint failed".to_string(),
                },
                "CONFLICT",
            ),
            (
                CoreError::corrupt("isolation", "iso-1", "unknown state"),
                "CORRUPT_RECORD",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "connection refused".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected);
        }
    }

    #[test]
    fn test_display() {
        let err = CoreError::Conflict {
            resource: "instance".to_string(),
            details: "name taken".to_string(),
        };
        assert_eq!(err.to_string(), "Conflicting instance write: name taken");

        let err = CoreError::corrupt("isolation", "iso-1", "unknown state 'x'");
        assert!(err.to_string().contains("iso-1"));
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
