// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for debug replay against a recorded operation stream.

mod common;

use common::*;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use duratx_core::{
    CommunicatorContext, DuraError, Registry, RetryPolicy, TransactionConfig, TransactionContext,
    WorkflowContext, WorkflowParams,
};

fn insert_row(
    ctx: TransactionContext<'_>,
    (name,): (String,),
) -> BoxFuture<'_, duratx_core::Result<i64>> {
    Box::pin(async move {
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO duratx_test_rows (name) VALUES ($1) RETURNING id")
                .bind(&name)
                .fetch_one(&mut *ctx.client)
                .await
                .map_err(DuraError::from)?;
        Ok(id)
    })
}

fn count_named(
    ctx: TransactionContext<'_>,
    (name,): (String,),
) -> BoxFuture<'_, duratx_core::Result<i64>> {
    Box::pin(async move {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM duratx_test_rows WHERE name = $1")
                .bind(&name)
                .fetch_one(&mut *ctx.client)
                .await
                .map_err(DuraError::from)?;
        Ok(count)
    })
}

fn test_registry() -> Registry {
    let read_only = TransactionConfig {
        read_only: true,
        ..Default::default()
    };
    Registry::builder()
        .transaction("insert_row", TransactionConfig::default(), insert_row)
        .transaction("count_named", read_only, count_named)
        .communicator(
            "echo",
            RetryPolicy::default(),
            |_ctx: CommunicatorContext, (text,): (String,)| async move { Ok(text) },
        )
        .workflow(
            "record_and_count",
            |ctx: WorkflowContext, (name,): (String,)| async move {
                let id: i64 = ctx.transaction("insert_row", (name.clone(),)).await?;
                let count: i64 = ctx.transaction("count_named", (name.clone(),)).await?;
                let echoed: String = ctx.communicator("echo", (name,)).await?;
                Ok(json!({ "id": id, "count": count, "echoed": echoed }))
            },
        )
        .workflow(
            "send_then_done",
            |ctx: WorkflowContext, (destination,): (String,)| async move {
                ctx.send(&destination, "ping", Some("replay-topic")).await?;
                Ok(1_i64)
            },
        )
        .build()
        .expect("registry builds")
}

#[tokio::test]
async fn test_replay_returns_recorded_outputs() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("rp-{}", &workflow_uuid[..8]);
    let handle = ctx
        .executor
        .workflow(
            "record_and_count",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![json!(name)],
        )
        .await
        .expect("workflow starts");
    let original: Value = handle.result().await.expect("original result");
    assert_eq!(ctx.count_rows(&name).await, 1);

    let replayed = ctx
        .executor
        .debug_workflow(&workflow_uuid)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed, original, "every step returns the recorded value");

    // Replay fired no new side effects.
    assert_eq!(ctx.count_rows(&name).await, 1);

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}

#[tokio::test]
async fn test_replay_fails_on_missing_recording() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("rm-{}", &workflow_uuid[..8]);
    let handle = ctx
        .executor
        .workflow(
            "record_and_count",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![json!(name)],
        )
        .await
        .expect("workflow starts");
    let _: Value = handle.result().await.expect("original result");

    // Drop the communicator's recording (function id 2) to force a
    // divergence.
    sqlx::query(
        "DELETE FROM dbos.operation_outputs WHERE workflow_uuid = $1 AND function_id = 2",
    )
    .bind(&workflow_uuid)
    .execute(&ctx.pool)
    .await
    .expect("delete recording");

    let result = ctx.executor.debug_workflow(&workflow_uuid).await;
    match result {
        Err(DuraError::Debugger { reason }) => {
            assert!(reason.contains("cannot find recorded"));
        }
        other => panic!("expected DebuggerError, got {:?}", other.map(|_| ())),
    }

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}

#[tokio::test]
async fn test_replay_never_resends_messages() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let destination = Uuid::new_v4().to_string();
    let handle = ctx
        .executor
        .workflow(
            "send_then_done",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![json!(destination)],
        )
        .await
        .expect("workflow starts");
    let out: i64 = handle.result().await.expect("original result");
    assert_eq!(out, 1);

    let queued = |pool: &sqlx::PgPool| {
        let pool = pool.clone();
        let destination = destination.clone();
        async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM dbos.notifications WHERE destination_uuid = $1",
            )
            .bind(&destination)
            .fetch_one(&pool)
            .await
            .expect("count notifications");
            count
        }
    };
    assert_eq!(queued(&ctx.pool).await, 1);

    let replayed = ctx
        .executor
        .debug_workflow(&workflow_uuid)
        .await
        .expect("replay succeeds");
    assert_eq!(replayed, json!(1));
    assert_eq!(queued(&ctx.pool).await, 1, "replay does not enqueue again");

    sqlx::query("DELETE FROM dbos.notifications WHERE destination_uuid = $1")
        .bind(&destination)
        .execute(&ctx.pool)
        .await
        .ok();
    ctx.cleanup_workflow(&workflow_uuid).await;
}
