// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for duratx-core.
//!
//! Provides a unified error type covering engine, database, and user-facing
//! failures, with a stable error-code string for each kind.

use std::fmt;

/// Result type using DuraError
pub type Result<T> = std::result::Result<T, DuraError>;

/// Errors that can occur while starting, executing, or recovering workflows.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DuraError {
    /// Configuration or schema setup failed; fatal at process start.
    Initialization {
        /// What went wrong during initialization.
        reason: String,
    },

    /// Invocation targeted an operation that was never registered.
    NotRegistered {
        /// The operation name that was looked up.
        name: String,
    },

    /// Duplicate-key collision on a step output row. Indicates a racing
    /// identical invocation or a determinism violation in the user body.
    WorkflowConflict {
        /// The workflow the collision occurred in.
        workflow_uuid: String,
    },

    /// A workflow UUID was reused with a different operation than the one
    /// first recorded under it.
    ConflictingWorkflow {
        /// The reused workflow UUID.
        workflow_uuid: String,
        /// The operation name recorded at first invocation.
        recorded_name: String,
        /// The operation name of the conflicting invocation.
        requested_name: String,
    },

    /// `set_event` was called twice with the same key.
    DuplicateWorkflowEvent {
        /// The workflow that published the event.
        workflow_uuid: String,
        /// The duplicated event key.
        key: String,
    },

    /// The workflow exhausted its recovery attempts and was moved to the
    /// dead-letter state.
    DeadLetterQueue {
        /// The dead-lettered workflow UUID.
        workflow_uuid: String,
        /// The configured attempt limit that was reached.
        max_attempts: u32,
    },

    /// The workflow was cancelled while in flight.
    WorkflowCancelled {
        /// The cancelled workflow UUID.
        workflow_uuid: String,
    },

    /// Replay diverged from the recorded operation stream.
    Debugger {
        /// Description of the divergence.
        reason: String,
    },

    /// The caller's identity does not carry any of the roles the operation
    /// requires.
    NotAuthorized {
        /// The operation that was denied.
        name: String,
        /// The roles the operation requires.
        required_roles: Vec<String>,
    },

    /// An application-level error propagated out of a user step body.
    /// Carries the original error code and message so recorded errors
    /// round-trip through the database.
    Application {
        /// Stable code of the original error kind.
        code: String,
        /// Human-readable message of the original error.
        message: String,
    },

    /// A response-shaped application error with an HTTP status, propagated
    /// but never interpreted by the engine.
    Response {
        /// HTTP status code chosen by the application.
        status: u16,
        /// Response message.
        message: String,
    },

    /// A workflow UUID was referenced that has no recorded state.
    WorkflowNotFound {
        /// The unknown workflow UUID.
        workflow_uuid: String,
    },

    /// Database operation failed.
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
        /// SQLSTATE code when the database reported one. The engine keys
        /// its retry decisions off this.
        code: Option<String>,
    },

    /// Serializing or deserializing a recorded value failed.
    Serialization {
        /// Error details.
        details: String,
    },
}

impl DuraError {
    /// Get the stable error-code string for this error kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "INITIALIZATION_ERROR",
            Self::NotRegistered { .. } => "NOT_REGISTERED",
            Self::WorkflowConflict { .. } => "WORKFLOW_CONFLICT",
            Self::ConflictingWorkflow { .. } => "CONFLICTING_WORKFLOW",
            Self::DuplicateWorkflowEvent { .. } => "DUPLICATE_WORKFLOW_EVENT",
            Self::DeadLetterQueue { .. } => "DEAD_LETTER_QUEUE",
            Self::WorkflowCancelled { .. } => "WORKFLOW_CANCELLED",
            Self::Debugger { .. } => "DEBUGGER_ERROR",
            Self::NotAuthorized { .. } => "NOT_AUTHORIZED",
            Self::Application { .. } => "APPLICATION_ERROR",
            Self::Response { .. } => "RESPONSE_ERROR",
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Build an application error from any displayable value.
    pub fn application(message: impl fmt::Display) -> Self {
        Self::Application {
            code: "APPLICATION_ERROR".to_string(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for DuraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialization { reason } => {
                write!(f, "Initialization failed: {}", reason)
            }
            Self::NotRegistered { name } => {
                write!(f, "Operation '{}' is not registered", name)
            }
            Self::WorkflowConflict { workflow_uuid } => {
                write!(f, "Conflicting step output write in workflow '{}'", workflow_uuid)
            }
            Self::ConflictingWorkflow {
                workflow_uuid,
                recorded_name,
                requested_name,
            } => {
                write!(
                    f,
                    "Workflow '{}' was first started as '{}' but re-invoked as '{}'",
                    workflow_uuid, recorded_name, requested_name
                )
            }
            Self::DuplicateWorkflowEvent { workflow_uuid, key } => {
                write!(
                    f,
                    "Workflow '{}' already published event '{}'",
                    workflow_uuid, key
                )
            }
            Self::DeadLetterQueue {
                workflow_uuid,
                max_attempts,
            } => {
                write!(
                    f,
                    "Workflow '{}' exceeded {} recovery attempts",
                    workflow_uuid, max_attempts
                )
            }
            Self::WorkflowCancelled { workflow_uuid } => {
                write!(f, "Workflow '{}' was cancelled", workflow_uuid)
            }
            Self::Debugger { reason } => {
                write!(f, "Replay diverged: {}", reason)
            }
            Self::NotAuthorized {
                name,
                required_roles,
            } => {
                write!(
                    f,
                    "Operation '{}' requires one of roles {:?}",
                    name, required_roles
                )
            }
            Self::Application { code, message } => {
                write!(f, "{}: {}", code, message)
            }
            Self::Response { status, message } => {
                write!(f, "HTTP {}: {}", status, message)
            }
            Self::WorkflowNotFound { workflow_uuid } => {
                write!(f, "Workflow '{}' not found", workflow_uuid)
            }
            Self::Database {
                operation, details, ..
            } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::Serialization { details } => {
                write!(f, "Serialization error: {}", details)
            }
        }
    }
}

impl std::error::Error for DuraError {}

impl From<sqlx::Error> for DuraError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db) => db.code().map(|c| c.to_string()),
            _ => None,
        };
        DuraError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
            code,
        }
    }
}

impl From<serde_json::Error> for DuraError {
    fn from(err: serde_json::Error) -> Self {
        DuraError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(DuraError, &str)> = vec![
            (
                DuraError::Initialization {
                    reason: "no schema".to_string(),
                },
                "INITIALIZATION_ERROR",
            ),
            (
                DuraError::NotRegistered {
                    name: "op".to_string(),
                },
                "NOT_REGISTERED",
            ),
            (
                DuraError::WorkflowConflict {
                    workflow_uuid: "u".to_string(),
                },
                "WORKFLOW_CONFLICT",
            ),
            (
                DuraError::DuplicateWorkflowEvent {
                    workflow_uuid: "u".to_string(),
                    key: "k".to_string(),
                },
                "DUPLICATE_WORKFLOW_EVENT",
            ),
            (
                DuraError::DeadLetterQueue {
                    workflow_uuid: "u".to_string(),
                    max_attempts: 3,
                },
                "DEAD_LETTER_QUEUE",
            ),
            (
                DuraError::WorkflowCancelled {
                    workflow_uuid: "u".to_string(),
                },
                "WORKFLOW_CANCELLED",
            ),
            (
                DuraError::Debugger {
                    reason: "missing row".to_string(),
                },
                "DEBUGGER_ERROR",
            ),
        ];

        for (error, expected_code) in cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_display_messages() {
        let err = DuraError::NotRegistered {
            name: "checkout".to_string(),
        };
        assert_eq!(err.to_string(), "Operation 'checkout' is not registered");

        let err = DuraError::ConflictingWorkflow {
            workflow_uuid: "abc".to_string(),
            recorded_name: "payment".to_string(),
            requested_name: "refund".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Workflow 'abc' was first started as 'payment' but re-invoked as 'refund'"
        );

        let err = DuraError::DeadLetterQueue {
            workflow_uuid: "abc".to_string(),
            max_attempts: 5,
        };
        assert_eq!(err.to_string(), "Workflow 'abc' exceeded 5 recovery attempts");
    }

    #[test]
    fn test_application_constructor() {
        let err = DuraError::application("boom");
        assert_eq!(err.error_code(), "APPLICATION_ERROR");
        assert!(err.to_string().contains("boom"));
    }
}
