// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for crash recovery, dead-lettering, and cancellation.

mod common;

use std::time::Duration;

use common::*;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use uuid::Uuid;

use duratx_core::{
    DuraError, Registry, TransactionConfig, TransactionContext, WorkflowContext, WorkflowParams,
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

fn test_registry() -> Registry {
    Registry::builder()
        .transaction("insert_row", TransactionConfig::default(), insert_row)
        .workflow(
            "two_phase",
            |ctx: WorkflowContext, (name,): (String,)| async move {
                let _a: i64 = ctx.transaction("insert_row", (format!("{}-a", name),)).await?;
                ctx.sleep(2).await?;
                let b: i64 = ctx.transaction("insert_row", (format!("{}-b", name),)).await?;
                Ok(b)
            },
        )
        .workflow("blocker", |ctx: WorkflowContext, (): ()| async move {
            // Parks on a topic nothing publishes to; recovery cycles find
            // the workflow still PENDING.
            let msg: Option<Value> = ctx.recv(Some("never"), 30).await?;
            Ok(msg.is_some())
        })
        .workflow(
            "cancel_target",
            |ctx: WorkflowContext, (name,): (String,)| async move {
                let _msg: Option<Value> = ctx.recv(Some("go"), 10).await?;
                let id: i64 = ctx.transaction("insert_row", (name,)).await?;
                Ok(id)
            },
        )
        .build()
        .expect("registry builds")
}

async fn wait_until(mut probe: impl FnMut() -> BoxFuture<'static, bool>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if probe().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_resume_continues_from_last_recorded_step() {
    skip_if_no_db!();
    let executor_id = format!("exec-{}", Uuid::new_v4());
    let tweak_id = executor_id.clone();
    let Some(ctx) = TestContext::with_config(test_registry(), move |c| {
        c.executor_id = tweak_id;
    })
    .await
    else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("cr-{}", &workflow_uuid[..8]);
    let handle = ctx
        .executor
        .workflow(
            "two_phase",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![json!(name)],
        )
        .await
        .expect("workflow starts");

    // Wait until phase A committed; the body is now inside its sleep, the
    // moment a crash would strand it.
    let pool = ctx.pool.clone();
    let a_name = format!("{}-a", name);
    let arrived = wait_until(
        move || {
            let pool = pool.clone();
            let a_name = a_name.clone();
            Box::pin(async move {
                let (count,): (i64,) =
                    sqlx::query_as("SELECT COUNT(*) FROM duratx_test_rows WHERE name = $1")
                        .bind(&a_name)
                        .fetch_one(&pool)
                        .await
                        .unwrap_or((0,));
                count == 1
            })
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(arrived, "phase A should commit");

    // A second executor with the same identity stands in for the restarted
    // process.
    let tweak_id = executor_id.clone();
    let Some(ctx2) = TestContext::with_config(test_registry(), move |c| {
        c.executor_id = tweak_id;
    })
    .await
    else {
        return;
    };
    let recovered = ctx2
        .executor
        .recover_pending_workflows(None)
        .await
        .expect("recovery runs");
    let recovered_handle = recovered
        .into_iter()
        .find(|h| h.workflow_uuid() == workflow_uuid)
        .expect("pending workflow is recovered");

    let from_recovery: i64 = recovered_handle.result().await.expect("recovered result");
    let from_original: i64 = handle.result().await.expect("original result");
    assert_eq!(from_recovery, from_original);

    // Phase A was not re-run and phase B landed exactly once.
    assert_eq!(ctx.count_rows(&format!("{}-a", name)).await, 1);
    assert_eq!(ctx.count_rows(&format!("{}-b", name)).await, 1);
    assert_eq!(ctx.recovery_attempts(&workflow_uuid).await, 1);

    ctx.flush().await;
    ctx2.flush().await;
    assert_eq!(
        ctx.workflow_status(&workflow_uuid).await.as_deref(),
        Some("SUCCESS")
    );

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&format!("{}-a", name)).await;
    ctx.cleanup_rows(&format!("{}-b", name)).await;
}

#[tokio::test]
async fn test_dead_letter_after_recovery_limit() {
    skip_if_no_db!();
    let executor_id = format!("exec-{}", Uuid::new_v4());
    let tweak_id = executor_id.clone();
    let Some(ctx) = TestContext::with_config(test_registry(), move |c| {
        c.executor_id = tweak_id;
        c.max_recovery_attempts = 3;
    })
    .await
    else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    ctx.executor
        .workflow(
            "blocker",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .expect("blocker starts");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // First two cycles resume the workflow.
    for expected_attempts in 1..=2 {
        let handles = ctx
            .executor
            .recover_pending_workflows(None)
            .await
            .expect("recovery runs");
        assert_eq!(handles.len(), 1, "cycle {} resumes", expected_attempts);
        assert_eq!(ctx.recovery_attempts(&workflow_uuid).await, expected_attempts);
    }

    // The third cycle crosses the limit and dead-letters instead.
    let handles = ctx
        .executor
        .recover_pending_workflows(None)
        .await
        .expect("recovery runs");
    assert!(handles.is_empty(), "dead-lettered workflow is not resumed");
    assert_eq!(ctx.recovery_attempts(&workflow_uuid).await, 3);
    assert_eq!(
        ctx.workflow_status(&workflow_uuid).await.as_deref(),
        Some("RETRIES_EXCEEDED")
    );

    // Further passes are no-ops for this UUID.
    let handles = ctx
        .executor
        .recover_pending_workflows(None)
        .await
        .expect("recovery runs");
    assert!(handles.is_empty());
    assert_eq!(ctx.recovery_attempts(&workflow_uuid).await, 3);

    ctx.cleanup_workflow(&workflow_uuid).await;
}

#[tokio::test]
async fn test_cancellation_observed_at_next_step() {
    skip_if_no_db!();
    let executor_id = format!("exec-{}", Uuid::new_v4());
    let tweak_id = executor_id.clone();
    let Some(ctx) = TestContext::with_config(test_registry(), move |c| {
        c.executor_id = tweak_id;
    })
    .await
    else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("cx-{}", &workflow_uuid[..8]);
    let handle = ctx
        .executor
        .workflow(
            "cancel_target",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![json!(name)],
        )
        .await
        .expect("workflow starts");
    tokio::time::sleep(Duration::from_millis(200)).await;

    ctx.executor
        .cancel_workflow(&workflow_uuid)
        .await
        .expect("cancel succeeds");
    assert_eq!(
        ctx.workflow_status(&workflow_uuid).await.as_deref(),
        Some("CANCELLED")
    );

    // Unblock the recv; the body must observe the cancellation at the next
    // step instead of running the transaction.
    ctx.executor
        .send(&workflow_uuid, json!("go"), Some("go"), None)
        .await
        .expect("send succeeds");

    let result: duratx_core::Result<i64> = handle.result().await;
    match result {
        Err(DuraError::WorkflowCancelled { .. }) => {}
        Err(DuraError::Application { code, .. }) if code == "WORKFLOW_CANCELLED" => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
    assert_eq!(ctx.count_rows(&name).await, 0, "no effects after cancel");

    // Cancelled workflows are invisible to recovery.
    let handles = ctx
        .executor
        .recover_pending_workflows(None)
        .await
        .expect("recovery runs");
    assert!(handles.iter().all(|h| h.workflow_uuid() != workflow_uuid));

    ctx.cleanup_workflow(&workflow_uuid).await;
}
