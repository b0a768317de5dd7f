// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for once-and-only-once execution.

mod common;

use common::*;
use futures::future::BoxFuture;
use serde_json::json;
use uuid::Uuid;

use duratx_core::{
    DuraError, Registry, TransactionConfig, TransactionContext, WorkflowContext, WorkflowIdentity,
    WorkflowParams,
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
            "increment_and_insert",
            |ctx: WorkflowContext, (name,): (String,)| async move {
                let id: i64 = ctx.transaction("insert_row", (name,)).await?;
                Ok(id)
            },
        )
        .workflow(
            "restricted",
            |_ctx: WorkflowContext, (): ()| async move { Ok("ok".to_string()) },
        )
        .require_roles("restricted", &["admin"])
        .build()
        .expect("registry builds")
}

#[tokio::test]
async fn test_oaoo_under_duplicate_submission() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        eprintln!("Skipping test: failed to create test context");
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("dup-{}", &workflow_uuid[..8]);

    let params = |uuid: &str| WorkflowParams {
        workflow_uuid: Some(uuid.to_string()),
        ..Default::default()
    };
    let first = ctx
        .executor
        .workflow("increment_and_insert", params(&workflow_uuid), vec![json!(name)])
        .await
        .expect("first submission starts");
    let second = ctx
        .executor
        .workflow("increment_and_insert", params(&workflow_uuid), vec![json!(name)])
        .await
        .expect("second submission starts");

    let first_id: i64 = first.result().await.expect("first result");
    let second_id: i64 = second.result().await.expect("second result");
    assert_eq!(first_id, second_id, "both callers observe the same id");

    assert_eq!(ctx.count_rows(&name).await, 1, "exactly one row inserted");
    assert_eq!(ctx.recovery_attempts(&workflow_uuid).await, 0);

    ctx.flush().await;
    assert_eq!(
        ctx.workflow_status(&workflow_uuid).await.as_deref(),
        Some("SUCCESS")
    );

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}

#[tokio::test]
async fn test_duplicate_inputs_first_writer_wins() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("fw-{}", &workflow_uuid[..8]);
    let params = WorkflowParams {
        workflow_uuid: Some(workflow_uuid.clone()),
        ..Default::default()
    };

    let first = ctx
        .executor
        .workflow("increment_and_insert", params.clone(), vec![json!(name)])
        .await
        .expect("first submission");
    let _: i64 = first.result().await.expect("first result");

    // A later call with different arguments replays the first-committed
    // inputs rather than running with the new ones.
    let second = ctx
        .executor
        .workflow(
            "increment_and_insert",
            params,
            vec![json!(format!("{}-other", name))],
        )
        .await
        .expect("second submission");
    let _: i64 = second.result().await.expect("second result");

    assert_eq!(ctx.count_rows(&name).await, 1);
    assert_eq!(ctx.count_rows(&format!("{}-other", name)).await, 0);

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}

#[tokio::test]
async fn test_temp_transaction_workflow_is_idempotent() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("temp-{}", &workflow_uuid[..8]);
    let params = WorkflowParams {
        workflow_uuid: Some(workflow_uuid.clone()),
        ..Default::default()
    };

    let first = ctx
        .executor
        .transaction("insert_row", params.clone(), vec![json!(name)])
        .await
        .expect("first invocation");
    let second = ctx
        .executor
        .transaction("insert_row", params, vec![json!(name)])
        .await
        .expect("second invocation");

    assert_eq!(first, second);
    assert_eq!(ctx.count_rows(&name).await, 1);

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}

#[tokio::test]
async fn test_unregistered_operation_is_rejected() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let result = ctx
        .executor
        .workflow("missing", WorkflowParams::default(), vec![])
        .await;
    match result {
        Err(DuraError::NotRegistered { name }) => assert_eq!(name, "missing"),
        other => panic!("expected NotRegistered, got {:?}", other.map(|_| ())),
    }

    // A transaction name is not invocable as a workflow.
    let result = ctx
        .executor
        .workflow("insert_row", WorkflowParams::default(), vec![json!("x")])
        .await;
    assert!(matches!(result, Err(DuraError::NotRegistered { .. })));
}

#[tokio::test]
async fn test_required_roles_are_enforced() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let result = ctx
        .executor
        .workflow("restricted", WorkflowParams::default(), vec![])
        .await;
    match result {
        Err(DuraError::NotAuthorized { required_roles, .. }) => {
            assert_eq!(required_roles, vec!["admin"]);
        }
        other => panic!("expected NotAuthorized, got {:?}", other.map(|_| ())),
    }

    let workflow_uuid = Uuid::new_v4().to_string();
    let params = WorkflowParams {
        workflow_uuid: Some(workflow_uuid.clone()),
        identity: WorkflowIdentity {
            authenticated_user: Some("alice".to_string()),
            assumed_role: None,
            authenticated_roles: vec!["viewer".to_string(), "admin".to_string()],
        },
        ..Default::default()
    };
    let handle = ctx
        .executor
        .workflow("restricted", params, vec![])
        .await
        .expect("authorized invocation starts");
    let out: String = handle.result().await.expect("authorized result");
    assert_eq!(out, "ok");

    let status = handle.status().await.expect("status").expect("row exists");
    assert_eq!(status.assumed_role.as_deref(), Some("admin"));

    ctx.cleanup_workflow(&workflow_uuid).await;
}

#[tokio::test]
async fn test_reusing_uuid_for_different_workflow_conflicts() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let name = format!("conflict-{}", &workflow_uuid[..8]);
    let params = WorkflowParams {
        workflow_uuid: Some(workflow_uuid.clone()),
        identity: WorkflowIdentity {
            authenticated_roles: vec!["admin".to_string()],
            ..Default::default()
        },
        ..Default::default()
    };

    let handle = ctx
        .executor
        .workflow("increment_and_insert", params.clone(), vec![json!(name)])
        .await
        .expect("first workflow starts");
    let _: i64 = handle.result().await.expect("first result");

    let result = ctx.executor.workflow("restricted", params, vec![]).await;
    match result {
        Err(DuraError::ConflictingWorkflow {
            recorded_name,
            requested_name,
            ..
        }) => {
            assert_eq!(recorded_name, "increment_and_insert");
            assert_eq!(requested_name, "restricted");
        }
        other => panic!("expected ConflictingWorkflow, got {:?}", other.map(|_| ())),
    }

    ctx.cleanup_workflow(&workflow_uuid).await;
    ctx.cleanup_rows(&name).await;
}
