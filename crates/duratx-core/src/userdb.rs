// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User-database adapter.
//!
//! A uniform transactional client over the application's own database.
//! Transaction steps run inside a transaction opened here, at the
//! configured isolation level, and the step's output row is inserted into
//! `dbos.transaction_outputs` on the same connection, so the application's
//! effects and the engine's bookkeeping commit atomically.

use serde_json::Value;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::error::{DuraError, Result};
use crate::sysdb::is_unique_violation;
use crate::types::{
    epoch_millis, OperationOutputRecord, RecordedError, TransactionConfig,
};

/// The application database behind the engine's transaction steps.
pub struct UserDatabase {
    pool: PgPool,
}

impl UserDatabase {
    /// Wrap an existing pool to the application database.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, exposed so applications can run their own
    /// queries outside workflow steps.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction at the step's configured isolation level.
    pub(crate) async fn begin(
        &self,
        config: &TransactionConfig,
    ) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        let mode = if config.read_only { "READ ONLY" } else { "READ WRITE" };
        let statement = format!(
            "SET TRANSACTION ISOLATION LEVEL {} {}",
            config.isolation.as_sql(),
            mode
        );
        sqlx::query(&statement).execute(&mut *tx).await?;
        Ok(tx)
    }

    /// Record a definitive transaction-step failure. Runs in its own
    /// transaction; the failed user transaction has already rolled back.
    pub(crate) async fn record_transaction_error(
        &self,
        workflow_uuid: &str,
        function_id: i32,
        error: &DuraError,
    ) -> Result<()> {
        let error_json = RecordedError::to_json(error);
        let result = sqlx::query(
            r#"
            INSERT INTO dbos.transaction_outputs
                (workflow_uuid, function_id, error, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .bind(&error_json)
        .bind(epoch_millis())
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(DuraError::WorkflowConflict {
                workflow_uuid: workflow_uuid.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Probe the recorded output of a transaction step from outside any
    /// transaction. Used by replay.
    pub(crate) async fn check_transaction_output(
        &self,
        workflow_uuid: &str,
        function_id: i32,
    ) -> Result<Option<OperationOutputRecord>> {
        check_transaction_output(&self.pool, workflow_uuid, function_id).await
    }
}

/// Probe the recorded output of a transaction step on any executor,
/// including the open step transaction itself.
pub(crate) async fn check_transaction_output<'e, E>(
    executor: E,
    workflow_uuid: &str,
    function_id: i32,
) -> Result<Option<OperationOutputRecord>>
where
    E: sqlx::PgExecutor<'e>,
{
    let record = sqlx::query_as::<_, OperationOutputRecord>(
        r#"
        SELECT output, error, txn_snapshot, txn_id
        FROM dbos.transaction_outputs
        WHERE workflow_uuid = $1 AND function_id = $2
        "#,
    )
    .bind(workflow_uuid)
    .bind(function_id)
    .fetch_optional(executor)
    .await?;
    Ok(record)
}

/// Persist buffered read-only step outputs alongside a write transaction.
/// Rows already recorded by a racing identical invocation are skipped.
pub(crate) async fn record_buffered_outputs(
    tx: &mut PgConnection,
    workflow_uuid: &str,
    entries: &[(i32, Value)],
) -> std::result::Result<(), sqlx::Error> {
    for (function_id, output) in entries {
        let output_json =
            serde_json::to_string(output).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            r#"
            INSERT INTO dbos.transaction_outputs
                (workflow_uuid, function_id, output, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_uuid, function_id) DO NOTHING
            "#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .bind(&output_json)
        .bind(epoch_millis())
        .execute(&mut *tx)
        .await?;
    }
    Ok(())
}

/// Insert the step's output row on the open transaction, stamping the
/// current PostgreSQL snapshot and transaction id for time-travel reads.
/// The row commits, or not, together with the user's effects.
pub(crate) async fn record_transaction_output(
    tx: &mut PgConnection,
    workflow_uuid: &str,
    function_id: i32,
    output: &Value,
) -> std::result::Result<(), sqlx::Error> {
    let output_json =
        serde_json::to_string(output).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO dbos.transaction_outputs
            (workflow_uuid, function_id, output, txn_snapshot, txn_id, created_at)
        VALUES ($1, $2, $3, (pg_current_snapshot())::text, (pg_current_xact_id())::text, $4)
        "#,
    )
    .bind(workflow_uuid)
    .bind(function_id)
    .bind(&output_json)
    .bind(epoch_millis())
    .execute(tx)
    .await?;
    Ok(())
}
