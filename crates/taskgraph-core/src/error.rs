// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskgraph-core.

use thiserror::Error;

use crate::graph::ValidationError;

/// Crate-wide errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A graph or task definition was rejected.
    #[error("Invalid definition: {0}")]
    Validation(#[from] ValidationError),

    /// A definition was submitted without a field it must carry.
    #[error("Definition is missing required field '{field}'")]
    MissingField {
        /// Name of the missing field (wire spelling).
        field: &'static str,
    },

    /// A graph was requested by a name the registry does not know.
    #[error("Graph definition not found: {0}")]
    GraphNotFound(String),

    /// A target already has a live graph bound to it.
    #[error("Duplicate active graph for target '{target}' (instance {instance_id})")]
    DuplicateActiveGraph {
        /// The occupied target.
        target: String,
        /// Instance currently holding the target.
        instance_id: String,
    },

    /// Stored value could not be mapped back to a domain type.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a user-facing rejection rather than an
    /// infrastructure fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::MissingField { .. }
                | Self::GraphNotFound(_)
                | Self::DuplicateActiveGraph { .. }
        )
    }
}

/// Result type using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_active_graph_display() {
        let err = Error::DuplicateActiveGraph {
            target: "node-1".to_string(),
            instance_id: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate active graph for target 'node-1' (instance abc)"
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn test_infrastructure_errors_are_not_rejections() {
        let err = Error::CorruptRecord("task state: unknown".to_string());
        assert!(!err.is_rejection());

        let err: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, Error::Json(_)));
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_validation_error_converts() {
        let err: Error = ValidationError::UnknownTask {
            label: "a".to_string(),
            task_name: "Task.Missing".to_string(),
        }
        .into();
        assert!(err.to_string().contains("Task.Missing"));
        assert!(err.is_rejection());
    }
}
