// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay execution against a recorded operation stream.
//!
//! Every step of a replayed workflow must find a recorded output row;
//! missing rows mean the replay diverged from the original execution.
//! Side-effect steps never fire again; read-only transactions re-run their
//! body and the fresh output is compared against the recorded one.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::context::{TransactionContext, WorkflowContext};
use crate::error::{DuraError, Result};
use crate::handle::WorkflowHandle;
use crate::registry::{Operation, OperationHandler};

/// Receiver of recorded transaction snapshot coordinates during replay.
///
/// An external query proxy can use the original `txn_id`/`txn_snapshot` to
/// serve time-travel reads against the user database as it was when the
/// step first committed.
#[async_trait]
pub trait DebugProxy: Send + Sync {
    /// Called once per replayed transaction step that has recorded
    /// snapshot coordinates.
    async fn on_transaction(
        &self,
        workflow_uuid: &str,
        function_id: i32,
        txn_id: &str,
        txn_snapshot: &str,
    );
}

/// Replay one transaction step.
pub(crate) async fn replay_transaction(
    ctx: &WorkflowContext,
    op: &Operation,
    function_id: i32,
    args: Vec<Value>,
) -> Result<Value> {
    let record = ctx
        .executor()
        .user_db()
        .check_transaction_output(ctx.workflow_uuid(), function_id)
        .await?
        .ok_or_else(|| DuraError::Debugger {
            reason: format!(
                "cannot find recorded transaction output for step {} of workflow '{}'",
                function_id,
                ctx.workflow_uuid()
            ),
        })?;

    if let Some(proxy) = ctx.executor().debug_proxy() {
        if let (Some(txn_id), Some(txn_snapshot)) = (&record.txn_id, &record.txn_snapshot) {
            proxy
                .on_transaction(ctx.workflow_uuid(), function_id, txn_id, txn_snapshot)
                .await;
        }
    }

    if !op.transaction_config.read_only {
        return record.into_outcome();
    }

    // Read-only bodies are harmless to re-run; do so and verify the result
    // still matches the recording.
    let handler = match &op.handler {
        OperationHandler::Transaction(f) => f.clone(),
        _ => {
            return Err(DuraError::NotRegistered {
                name: op.name.clone(),
            })
        }
    };
    let udb = ctx.executor().user_db();
    let mut tx = udb.begin(&op.transaction_config).await?;
    let tctx = TransactionContext {
        client: &mut *tx,
        workflow_uuid: ctx.workflow_uuid().to_string(),
        function_id,
        identity: ctx.identity().clone(),
    };
    let replayed = handler(tctx, args).await;
    drop(tx);

    let recorded = record.into_outcome();
    match (&replayed, &recorded) {
        (Ok(fresh), Ok(original)) if fresh != original => {
            warn!(
                workflow_uuid = %ctx.workflow_uuid(),
                function_id,
                "Read-only transaction output diverged from the recording"
            );
        }
        (Err(e), Ok(_)) => {
            warn!(
                workflow_uuid = %ctx.workflow_uuid(),
                function_id,
                error = %e,
                "Read-only transaction failed on replay; returning the recorded output"
            );
        }
        _ => {}
    }
    recorded
}

/// Replay a non-transaction step, returning its recorded outcome.
pub(crate) async fn replay_recorded_value(
    ctx: &WorkflowContext,
    function_id: i32,
    what: &str,
) -> Result<Value> {
    ctx.executor()
        .system_db()
        .check_operation_output(ctx.workflow_uuid(), function_id)
        .await?
        .ok_or_else(|| DuraError::Debugger {
            reason: format!(
                "cannot find recorded {} output for step {} of workflow '{}'",
                what,
                function_id,
                ctx.workflow_uuid()
            ),
        })?
        .into_outcome()
}

/// Replay a step whose recorded outcome carries no value. A recorded error
/// still rethrows.
pub(crate) async fn replay_recorded_unit(
    ctx: &WorkflowContext,
    function_id: i32,
    what: &str,
) -> Result<()> {
    replay_recorded_value(ctx, function_id, what).await.map(|_| ())
}

/// Replay a child-workflow step, binding to the recorded child UUID.
pub(crate) async fn replay_child_workflow(
    ctx: &WorkflowContext,
    function_id: i32,
) -> Result<WorkflowHandle> {
    let recorded = replay_recorded_value(ctx, function_id, "child workflow").await?;
    let child_uuid = recorded
        .get("child_uuid")
        .and_then(Value::as_str)
        .ok_or_else(|| DuraError::Debugger {
            reason: format!(
                "recorded child workflow at step {} of '{}' has no UUID",
                function_id,
                ctx.workflow_uuid()
            ),
        })?;
    Ok(ctx.executor().retrieve_workflow(child_uuid))
}
