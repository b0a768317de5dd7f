// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Core types: workflow status, identity, step records, and retry policy.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DuraError;

/// Workflow status as stored in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    /// Workflow has been started and has not reached a terminal state.
    Pending,
    /// Workflow completed successfully.
    Success,
    /// Workflow terminated with an uncaught error.
    Error,
    /// Workflow was cancelled externally.
    Cancelled,
    /// Workflow exceeded its recovery attempt limit (dead-letter state).
    RetriesExceeded,
}

impl WorkflowStatus {
    /// The string stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Cancelled => "CANCELLED",
            Self::RetriesExceeded => "RETRIES_EXCEEDED",
        }
    }

    /// Parse a status column value. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "CANCELLED" => Some(Self::Cancelled),
            "RETRIES_EXCEEDED" => Some(Self::RetriesExceeded),
            _ => None,
        }
    }

    /// Terminal states are write-once.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Caller identity bound to a workflow invocation and recorded with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowIdentity {
    /// The authenticated user who started the workflow, if any.
    pub authenticated_user: Option<String>,
    /// The role the invocation runs under.
    pub assumed_role: Option<String>,
    /// All roles the authenticated user holds.
    pub authenticated_roles: Vec<String>,
}

/// Parameters for starting a workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowParams {
    /// Caller-supplied idempotency key. Generated as a v4 UUID when absent.
    pub workflow_uuid: Option<String>,
    /// Identity recorded with the workflow and checked against required roles.
    pub identity: WorkflowIdentity,
    /// Opaque request context recorded verbatim and re-presented on recovery.
    pub request: Option<Value>,
    /// Configured-instance name, recorded in the status row.
    pub config_name: Option<String>,
}

/// A status snapshot read back from the status table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowStatusRecord {
    /// The workflow's unique identifier.
    pub workflow_uuid: String,
    /// Status column value.
    pub status: String,
    /// Registered operation name.
    pub name: String,
    /// Class the operation was registered under.
    pub class_name: Option<String>,
    /// Configured-instance name.
    pub config_name: Option<String>,
    /// The authenticated user recorded at first invocation.
    pub authenticated_user: Option<String>,
    /// The role the invocation ran under.
    pub assumed_role: Option<String>,
    /// JSON array of the authenticated user's roles.
    pub authenticated_roles: Option<String>,
    /// Opaque request JSON recorded at first invocation.
    pub request: Option<String>,
    /// Serialized output for SUCCESS workflows.
    pub output: Option<String>,
    /// Serialized error for ERROR workflows.
    pub error: Option<String>,
    /// Identity of the executor that owns this workflow.
    pub executor_id: Option<String>,
    /// Application version recorded at first invocation.
    pub application_version: Option<String>,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
    /// Number of times recovery has resumed this workflow.
    pub recovery_attempts: i64,
}

impl WorkflowStatusRecord {
    /// Parsed status value.
    pub fn workflow_status(&self) -> Option<WorkflowStatus> {
        WorkflowStatus::parse(&self.status)
    }

    /// Reconstruct the identity recorded with this workflow.
    pub fn identity(&self) -> WorkflowIdentity {
        let authenticated_roles = self
            .authenticated_roles
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        WorkflowIdentity {
            authenticated_user: self.authenticated_user.clone(),
            assumed_role: self.assumed_role.clone(),
            authenticated_roles,
        }
    }
}

/// A recorded step output row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationOutputRecord {
    /// Serialized output, present when the step succeeded.
    pub output: Option<String>,
    /// Serialized error, present when the step failed definitively.
    pub error: Option<String>,
    /// PostgreSQL snapshot identifier, transaction steps only.
    pub txn_snapshot: Option<String>,
    /// PostgreSQL transaction identifier, transaction steps only.
    pub txn_id: Option<String>,
}

impl OperationOutputRecord {
    /// Resolve the recorded row into the step's outcome: the deserialized
    /// output on success, the rehydrated error on failure.
    pub fn into_outcome(self) -> Result<Value, DuraError> {
        if let Some(error) = self.error {
            return Err(RecordedError::from_json(&error).into());
        }
        match self.output {
            Some(output) => Ok(serde_json::from_str(&output)?),
            // A recorded null output (e.g. a timed-out recv) round-trips as JSON null.
            None => Ok(Value::Null),
        }
    }
}

/// Wire form of an error stored in an `error` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedError {
    /// Stable error-code string.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RecordedError {
    /// Serialize an engine error for storage.
    pub fn to_json(error: &DuraError) -> String {
        let recorded = RecordedError {
            code: error.error_code().to_string(),
            message: error.to_string(),
        };
        serde_json::to_string(&recorded)
            .unwrap_or_else(|_| r#"{"code":"SERIALIZATION_ERROR","message":""}"#.to_string())
    }

    /// Parse an error column value, tolerating rows written by older
    /// versions that stored a bare message.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| RecordedError {
            code: "APPLICATION_ERROR".to_string(),
            message: raw.to_string(),
        })
    }
}

impl From<RecordedError> for DuraError {
    fn from(recorded: RecordedError) -> Self {
        DuraError::Application {
            code: recorded.code,
            message: recorded.message,
        }
    }
}

/// Filter for listing workflows from the admin surface.
#[derive(Debug, Clone, Default)]
pub struct ListWorkflowsFilter {
    /// Only workflows created at or after this time (epoch milliseconds).
    pub start_time: Option<i64>,
    /// Only workflows created before this time (epoch milliseconds).
    pub end_time: Option<i64>,
    /// Only workflows in this status.
    pub status: Option<WorkflowStatus>,
    /// Only workflows registered under this operation name.
    pub name: Option<String>,
    /// Only workflows started by this authenticated user.
    pub authenticated_user: Option<String>,
    /// Only workflows recorded under this application version.
    pub application_version: Option<String>,
    /// Maximum number of UUIDs to return.
    pub limit: Option<i64>,
    /// Number of matching rows to skip.
    pub offset: Option<i64>,
}

/// Transaction isolation level for transaction steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// PostgreSQL READ COMMITTED.
    ReadCommitted,
    /// PostgreSQL REPEATABLE READ.
    RepeatableRead,
    /// PostgreSQL SERIALIZABLE (the default).
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// The SQL keyword sequence for SET TRANSACTION.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Configuration for a transaction step.
#[derive(Debug, Clone, Default)]
pub struct TransactionConfig {
    /// Isolation level for the user-database transaction.
    pub isolation: IsolationLevel,
    /// Read-only transactions skip the output insert and may safely re-run.
    pub read_only: bool,
}

/// Retry policy for communicator steps.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether failures are retried at all. When false the step runs once.
    pub retries_allowed: bool,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry, in milliseconds.
    pub interval_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Calculate the delay before a given retry (1-indexed: attempt 1 is the
    /// first retry, after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.interval_ms as f64 * factor).min(u64::MAX as f64);
        std::time::Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries_allowed: true,
            max_attempts: 3,
            interval_ms: 1_000,
            backoff_factor: 2.0,
        }
    }
}

/// Current time as epoch milliseconds, the unit of the BIGINT time columns.
pub(crate) fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}
