// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! System-database operations.
//!
//! Durable, ordered, concurrency-safe storage for workflow status, step
//! outputs, inter-workflow messages, workflow events, and workflow inputs,
//! plus the cross-process notification channel. Write-once rules rely on
//! primary keys: a unique violation means "already recorded", never a lock.

pub(crate) mod notifications;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{DuraError, Result};
use crate::types::{
    epoch_millis, ListWorkflowsFilter, OperationOutputRecord, RecordedError, WorkflowIdentity,
    WorkflowStatus, WorkflowStatusRecord,
};
use notifications::{
    event_key, notification_key, status_key, NotificationDispatcher,
};

/// Sentinel topic stored for messages sent without one.
pub(crate) const NULL_TOPIC: &str = "__null__topic__";

/// Initial delay between result polls.
const INITIAL_POLL_DELAY_MS: u64 = 5;

/// Maximum delay between result polls.
const MAX_POLL_DELAY_MS: u64 = 1_000;

/// Longest slice a recv/get_event waiter sleeps before re-reading the
/// database. Bounds the cost of a missed LISTEN wake.
const WAIT_SLICE: Duration = Duration::from_secs(1);

/// A terminal SUCCESS write deferred until the next buffer flush.
#[derive(Debug, Clone)]
struct BufferedOutput {
    output: Value,
    updated_at: i64,
}

/// Engine-owned storage in the system database.
///
/// All state lives in the `dbos` schema created by [`crate::migrations`].
/// The in-memory pieces are the terminal-status write buffer and the waiter
/// dispatcher fed by the LISTEN connection.
pub struct SystemDatabase {
    pool: PgPool,
    dispatcher: Arc<NotificationDispatcher>,
    status_buffer: Mutex<HashMap<String, BufferedOutput>>,
}

impl SystemDatabase {
    /// Wrap an existing pool. Migrations are the executor's concern.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            dispatcher: NotificationDispatcher::new(),
            status_buffer: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying pool, for admin queries and tests.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn dispatcher(&self) -> Arc<NotificationDispatcher> {
        self.dispatcher.clone()
    }

    /// `SELECT 1` probe.
    pub async fn health_check(&self) -> Result<bool> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }

    // ========================================================================
    // Workflow lifecycle
    // ========================================================================

    /// Create the PENDING status row and record the inputs, both idempotent,
    /// in one transaction. Returns the committed inputs: the caller's `args`
    /// on first insert, the originally recorded `args` on every later call
    /// with the same UUID (first writer wins).
    ///
    /// Reusing a UUID with a different operation name fails with
    /// `ConflictingWorkflow`.
    #[allow(clippy::too_many_arguments)]
    pub async fn init_workflow_status(
        &self,
        workflow_uuid: &str,
        name: &str,
        class_name: &str,
        config_name: Option<&str>,
        identity: &WorkflowIdentity,
        request: Option<&Value>,
        executor_id: &str,
        application_version: Option<&str>,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        let now = epoch_millis();
        let roles_json = serde_json::to_string(&identity.authenticated_roles)?;
        let request_json = request.map(serde_json::to_string).transpose()?;
        let inputs_json = serde_json::to_string(args)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_status
                (workflow_uuid, status, name, class_name, config_name,
                 authenticated_user, assumed_role, authenticated_roles, request,
                 executor_id, application_version, created_at, updated_at, recovery_attempts)
            VALUES ($1, 'PENDING', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, 0)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_uuid)
        .bind(name)
        .bind(class_name)
        .bind(config_name.unwrap_or(""))
        .bind(&identity.authenticated_user)
        .bind(&identity.assumed_role)
        .bind(&roles_json)
        .bind(&request_json)
        .bind(executor_id)
        .bind(application_version)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let (recorded_name,): (String,) =
            sqlx::query_as("SELECT name FROM dbos.workflow_status WHERE workflow_uuid = $1")
                .bind(workflow_uuid)
                .fetch_one(&mut *tx)
                .await?;
        if recorded_name != name {
            return Err(DuraError::ConflictingWorkflow {
                workflow_uuid: workflow_uuid.to_string(),
                recorded_name,
                requested_name: name.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_inputs (workflow_uuid, inputs)
            VALUES ($1, $2)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_uuid)
        .bind(&inputs_json)
        .execute(&mut *tx)
        .await?;

        let (recorded_inputs,): (String,) =
            sqlx::query_as("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
                .bind(workflow_uuid)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;

        Ok(serde_json::from_str(&recorded_inputs)?)
    }

    /// Read the workflow's terminal outcome.
    ///
    /// Returns `Ok(None)` while the workflow is PENDING or unknown, the
    /// deserialized output on SUCCESS, and the rehydrated error on ERROR,
    /// CANCELLED, or RETRIES_EXCEEDED.
    pub async fn check_workflow_output(&self, workflow_uuid: &str) -> Result<Option<Value>> {
        let row: Option<(String, Option<String>, Option<String>, i64)> = sqlx::query_as(
            r#"
            SELECT status, output, error, recovery_attempts
            FROM dbos.workflow_status
            WHERE workflow_uuid = $1
            "#,
        )
        .bind(workflow_uuid)
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, output, error, attempts)) = row else {
            return Ok(None);
        };
        match WorkflowStatus::parse(&status) {
            Some(WorkflowStatus::Success) => match output {
                Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
                None => Ok(Some(Value::Null)),
            },
            Some(WorkflowStatus::Error) => {
                let raw = error.unwrap_or_default();
                Err(RecordedError::from_json(&raw).into())
            }
            Some(WorkflowStatus::Cancelled) => Err(DuraError::WorkflowCancelled {
                workflow_uuid: workflow_uuid.to_string(),
            }),
            Some(WorkflowStatus::RetriesExceeded) => Err(DuraError::DeadLetterQueue {
                workflow_uuid: workflow_uuid.to_string(),
                max_attempts: attempts.max(0) as u32,
            }),
            _ => Ok(None),
        }
    }

    /// Defer the terminal SUCCESS write for this workflow until the next
    /// buffer flush. The output is immediately visible to in-process result
    /// waiters.
    pub fn buffer_workflow_output(&self, workflow_uuid: &str, output: Value) {
        self.status_buffer
            .lock()
            .expect("status buffer mutex poisoned")
            .insert(
                workflow_uuid.to_string(),
                BufferedOutput {
                    output,
                    updated_at: epoch_millis(),
                },
            );
        self.dispatcher.notify(&status_key(workflow_uuid));
    }

    /// Flush all buffered terminal writes in one batch transaction.
    ///
    /// Rows that left PENDING in the meantime (cancellation) keep their
    /// terminal status; the buffered entry is dropped either way.
    pub async fn flush_workflow_status_buffer(&self) -> Result<()> {
        let drained: Vec<(String, BufferedOutput)> = {
            let mut buffer = self
                .status_buffer
                .lock()
                .expect("status buffer mutex poisoned");
            buffer.drain().collect()
        };
        if drained.is_empty() {
            return Ok(());
        }

        let count = drained.len();
        let result: Result<()> = async {
            let mut tx = self.pool.begin().await?;
            for (uuid, entry) in &drained {
                let output_json = serde_json::to_string(&entry.output)?;
                sqlx::query(
                    r#"
                    UPDATE dbos.workflow_status
                    SET status = 'SUCCESS', output = $2, updated_at = $3
                    WHERE workflow_uuid = $1 AND status = 'PENDING'
                    "#,
                )
                .bind(uuid)
                .bind(&output_json)
                .bind(entry.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!(flushed = count, "Workflow status buffer flushed");
                for (uuid, _) in &drained {
                    self.dispatcher.notify(&status_key(uuid));
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Status buffer flush failed, re-buffering");
                let mut buffer = self
                    .status_buffer
                    .lock()
                    .expect("status buffer mutex poisoned");
                for (uuid, entry) in drained {
                    buffer.entry(uuid).or_insert(entry);
                }
                Err(e)
            }
        }
    }

    /// Record the terminal ERROR state. Write-once: a workflow already in a
    /// terminal state is left untouched.
    pub async fn record_workflow_error(&self, workflow_uuid: &str, error: &DuraError) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'ERROR', error = $2, updated_at = $3
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_uuid)
        .bind(RecordedError::to_json(error))
        .bind(epoch_millis())
        .execute(&self.pool)
        .await?;
        self.dispatcher.notify(&status_key(workflow_uuid));
        Ok(())
    }

    /// Block until the workflow reaches a terminal state and return its
    /// outcome. Waits on the in-process status announcement with a
    /// capped-backoff poll fallback for workflows owned by other processes.
    pub async fn get_workflow_result(&self, workflow_uuid: &str) -> Result<Value> {
        let mut delay = Duration::from_millis(INITIAL_POLL_DELAY_MS);
        loop {
            let waiter = self.dispatcher.register(&status_key(workflow_uuid));

            if let Some(buffered) = self
                .status_buffer
                .lock()
                .expect("status buffer mutex poisoned")
                .get(workflow_uuid)
            {
                return Ok(buffered.output.clone());
            }
            if let Some(output) = self.check_workflow_output(workflow_uuid).await? {
                return Ok(output);
            }

            waiter.wait_timeout(delay).await;
            delay = (delay * 2).min(Duration::from_millis(MAX_POLL_DELAY_MS));
        }
    }

    // ========================================================================
    // Step outputs
    // ========================================================================

    /// Look up the recorded output row for one step.
    pub async fn check_operation_output(
        &self,
        workflow_uuid: &str,
        function_id: i32,
    ) -> Result<Option<OperationOutputRecord>> {
        let record = sqlx::query_as::<_, OperationOutputRecord>(
            r#"
            SELECT output, error, txn_snapshot, txn_id
            FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Record a successful step output.
    pub async fn record_operation_output(
        &self,
        workflow_uuid: &str,
        function_id: i32,
        output: &Value,
    ) -> Result<()> {
        let output_json = serde_json::to_string(output)?;
        insert_operation_output(&self.pool, workflow_uuid, function_id, Some(&output_json), None)
            .await
    }

    /// Record a definitive step failure.
    pub async fn record_operation_error(
        &self,
        workflow_uuid: &str,
        function_id: i32,
        error: &DuraError,
    ) -> Result<()> {
        let error_json = RecordedError::to_json(error);
        insert_operation_output(&self.pool, workflow_uuid, function_id, None, Some(&error_json))
            .await
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    /// Enqueue one message for `destination_uuid` and record the send step,
    /// atomically. Idempotent under OAOO: a duplicate step write surfaces as
    /// `WorkflowConflict` and the message is not enqueued twice.
    pub async fn send(
        &self,
        sender_uuid: &str,
        function_id: i32,
        destination_uuid: &str,
        message: &Value,
        topic: Option<&str>,
    ) -> Result<()> {
        let topic = topic.unwrap_or(NULL_TOPIC);
        let message_json = serde_json::to_string(message)?;

        let mut tx = self.pool.begin().await?;
        insert_operation_output(&mut *tx, sender_uuid, function_id, Some("null"), None).await?;
        sqlx::query(
            r#"
            INSERT INTO dbos.notifications (destination_uuid, topic, message)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(destination_uuid)
        .bind(topic)
        .bind(&message_json)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(destination = %destination_uuid, topic, "Message sent");
        Ok(())
    }

    /// Consume the oldest message for `(receiver, topic)`, waiting up to
    /// `timeout`. The delete of the message row and the insert of the step
    /// output commit in one transaction, so each message is consumed at most
    /// once. A timeout records `null` as the step's outcome.
    pub async fn recv(
        &self,
        receiver_uuid: &str,
        function_id: i32,
        topic: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let topic = topic.unwrap_or(NULL_TOPIC);
        let deadline = Instant::now() + timeout;

        loop {
            let waiter = self
                .dispatcher
                .register(&notification_key(receiver_uuid, topic));

            let mut tx = self.pool.begin().await?;
            let row: Option<(String,)> = sqlx::query_as(
                r#"
                DELETE FROM dbos.notifications
                WHERE ctid IN (
                    SELECT ctid FROM dbos.notifications
                    WHERE destination_uuid = $1 AND topic = $2
                    ORDER BY created_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING message
                "#,
            )
            .bind(receiver_uuid)
            .bind(topic)
            .fetch_optional(&mut *tx)
            .await?;

            match row {
                Some((message,)) => {
                    insert_operation_output(
                        &mut *tx,
                        receiver_uuid,
                        function_id,
                        Some(&message),
                        None,
                    )
                    .await?;
                    tx.commit().await?;
                    return Ok(Some(serde_json::from_str(&message)?));
                }
                None => {
                    // Nothing queued; release the transaction before waiting.
                    tx.commit().await?;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    waiter.wait_timeout(remaining.min(WAIT_SLICE)).await;
                }
            }
        }

        insert_operation_output(&self.pool, receiver_uuid, function_id, Some("null"), None).await?;
        Ok(None)
    }

    // ========================================================================
    // Workflow events
    // ========================================================================

    /// Publish `(key, value)` for this workflow, at most once per key, and
    /// record the step output in the same transaction.
    pub async fn set_event(
        &self,
        workflow_uuid: &str,
        function_id: i32,
        key: &str,
        value: &Value,
    ) -> Result<()> {
        let value_json = serde_json::to_string(value)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO dbos.workflow_events (workflow_uuid, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid, key) DO NOTHING
            "#,
        )
        .bind(workflow_uuid)
        .bind(key)
        .bind(&value_json)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(DuraError::DuplicateWorkflowEvent {
                workflow_uuid: workflow_uuid.to_string(),
                key: key.to_string(),
            });
        }
        insert_operation_output(&mut *tx, workflow_uuid, function_id, Some("null"), None).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Read the event `key` published by `target_uuid`, waiting up to
    /// `timeout` for it to appear. When `caller` names a workflow step, the
    /// result (including `null` on timeout) is recorded as that step's
    /// output.
    pub async fn get_event(
        &self,
        target_uuid: &str,
        key: &str,
        timeout: Duration,
        caller: Option<(&str, i32)>,
    ) -> Result<Option<Value>> {
        let deadline = Instant::now() + timeout;

        let value = loop {
            let waiter = self.dispatcher.register(&event_key(target_uuid, key));

            let row: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT value FROM dbos.workflow_events
                WHERE workflow_uuid = $1 AND key = $2
                "#,
            )
            .bind(target_uuid)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((raw,)) = row {
                break Some(serde_json::from_str::<Value>(&raw)?);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break None;
            }
            waiter.wait_timeout(remaining.min(WAIT_SLICE)).await;
        };

        if let Some((caller_uuid, function_id)) = caller {
            let recorded = value.clone().unwrap_or(Value::Null);
            let recorded_json = serde_json::to_string(&recorded)?;
            insert_operation_output(&self.pool, caller_uuid, function_id, Some(&recorded_json), None)
                .await?;
        }
        Ok(value)
    }

    // ========================================================================
    // Recovery and admin
    // ========================================================================

    /// UUIDs of PENDING workflows owned by `executor_id`, optionally
    /// filtered by application version.
    pub async fn get_pending_workflows(
        &self,
        executor_id: &str,
        application_version: Option<&str>,
    ) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT workflow_uuid FROM dbos.workflow_status
            WHERE status = 'PENDING'
              AND executor_id = $1
              AND ($2::TEXT IS NULL OR application_version = $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(executor_id)
        .bind(application_version)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Status snapshot for one workflow.
    pub async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRecord>> {
        let record = sqlx::query_as::<_, WorkflowStatusRecord>(
            r#"
            SELECT workflow_uuid, status, name, class_name, config_name,
                   authenticated_user, assumed_role, authenticated_roles, request,
                   output, error, executor_id, application_version,
                   created_at, updated_at, recovery_attempts
            FROM dbos.workflow_status
            WHERE workflow_uuid = $1
            "#,
        )
        .bind(workflow_uuid)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// The recorded input row for one workflow.
    pub async fn get_workflow_inputs(&self, workflow_uuid: &str) -> Result<Option<Vec<Value>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
                .bind(workflow_uuid)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Bump the recovery counter and return the new value. The returned
    /// count makes the dead-letter decision race-free across executors.
    pub async fn increment_recovery_attempts(&self, workflow_uuid: &str) -> Result<i64> {
        let (attempts,): (i64,) = sqlx::query_as(
            r#"
            UPDATE dbos.workflow_status
            SET recovery_attempts = recovery_attempts + 1, updated_at = $2
            WHERE workflow_uuid = $1
            RETURNING recovery_attempts
            "#,
        )
        .bind(workflow_uuid)
        .bind(epoch_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(attempts)
    }

    /// Move a still-PENDING workflow to the dead-letter state.
    pub async fn mark_retries_exceeded(&self, workflow_uuid: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'RETRIES_EXCEEDED', updated_at = $2
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_uuid)
        .bind(epoch_millis())
        .execute(&self.pool)
        .await?;
        self.dispatcher.notify(&status_key(workflow_uuid));
        Ok(())
    }

    /// Cancel a non-terminal workflow. Resets the recovery counter so
    /// recovery passes will not resurrect it.
    pub async fn cancel_workflow(&self, workflow_uuid: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'CANCELLED', recovery_attempts = 0, updated_at = $2
            WHERE workflow_uuid = $1 AND status = 'PENDING'
            "#,
        )
        .bind(workflow_uuid)
        .bind(epoch_millis())
        .execute(&self.pool)
        .await?;
        self.dispatcher.notify(&status_key(workflow_uuid));
        Ok(())
    }

    /// Whether the workflow has been cancelled. Checked by the context at
    /// each step boundary.
    pub async fn is_cancelled(&self, workflow_uuid: &str) -> Result<bool> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM dbos.workflow_status WHERE workflow_uuid = $1")
                .bind(workflow_uuid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(matches!(row, Some((status,)) if status == "CANCELLED"))
    }

    /// List workflow UUIDs matching the filter, oldest first.
    pub async fn get_workflows(&self, filter: &ListWorkflowsFilter) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT workflow_uuid FROM dbos.workflow_status
            WHERE ($1::BIGINT IS NULL OR created_at >= $1)
              AND ($2::BIGINT IS NULL OR created_at < $2)
              AND ($3::TEXT IS NULL OR status = $3)
              AND ($4::TEXT IS NULL OR name = $4)
              AND ($5::TEXT IS NULL OR authenticated_user = $5)
              AND ($6::TEXT IS NULL OR application_version = $6)
            ORDER BY created_at ASC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(filter.start_time)
        .bind(filter.end_time)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.name)
        .bind(&filter.authenticated_user)
        .bind(&filter.application_version)
        .bind(filter.limit.unwrap_or(100))
        .bind(filter.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Delete every row belonging to one workflow across all five tables.
    pub async fn purge_workflow(&self, workflow_uuid: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in [
            "DELETE FROM dbos.operation_outputs WHERE workflow_uuid = $1",
            "DELETE FROM dbos.workflow_inputs WHERE workflow_uuid = $1",
            "DELETE FROM dbos.notifications WHERE destination_uuid = $1",
            "DELETE FROM dbos.workflow_events WHERE workflow_uuid = $1",
            "DELETE FROM dbos.workflow_status WHERE workflow_uuid = $1",
        ] {
            sqlx::query(statement)
                .bind(workflow_uuid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Insert one step output row. A duplicate key means the step was already
/// recorded by a racing identical invocation or a determinism violation,
/// surfaced as `WorkflowConflict`.
pub(crate) async fn insert_operation_output<'e, E>(
    executor: E,
    workflow_uuid: &str,
    function_id: i32,
    output: Option<&str>,
    error: Option<&str>,
) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO dbos.operation_outputs
            (workflow_uuid, function_id, output, error, created_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(workflow_uuid)
    .bind(function_id)
    .bind(output)
    .bind(error)
    .bind(epoch_millis())
    .execute(executor)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(DuraError::WorkflowConflict {
            workflow_uuid: workflow_uuid.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// PostgreSQL `unique_violation`, interpreted as "already recorded".
pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// PostgreSQL `serialization_failure`, interpreted as "retry the transaction".
pub(crate) fn is_serialization_failure(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("40001"))
}
