// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the admin surface: listing, status, health, purge.

mod common;

use common::*;
use uuid::Uuid;

use duratx_core::{
    ListWorkflowsFilter, Registry, WorkflowContext, WorkflowIdentity, WorkflowParams,
    WorkflowStatus,
};

fn test_registry() -> Registry {
    Registry::builder()
        .workflow("noop", |_ctx: WorkflowContext, (): ()| async move { Ok(42_i64) })
        .build()
        .expect("registry builds")
}

#[tokio::test]
async fn test_list_workflows_with_filters() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let user = format!("alice-{}", &workflow_uuid[..8]);
    let handle = ctx
        .executor
        .workflow(
            "noop",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                identity: WorkflowIdentity {
                    authenticated_user: Some(user.clone()),
                    ..Default::default()
                },
                ..Default::default()
            },
            vec![],
        )
        .await
        .expect("workflow starts");
    let _: i64 = handle.result().await.expect("workflow result");
    ctx.flush().await;

    let filter = ListWorkflowsFilter {
        name: Some("noop".to_string()),
        status: Some(WorkflowStatus::Success),
        authenticated_user: Some(user.clone()),
        ..Default::default()
    };
    let listed = ctx
        .executor
        .get_workflows(&filter)
        .await
        .expect("listing succeeds");
    assert_eq!(listed, vec![workflow_uuid.clone()]);

    // A disjoint status filter excludes it.
    let filter = ListWorkflowsFilter {
        authenticated_user: Some(user),
        status: Some(WorkflowStatus::Error),
        ..Default::default()
    };
    let listed = ctx
        .executor
        .get_workflows(&filter)
        .await
        .expect("listing succeeds");
    assert!(listed.is_empty());

    ctx.cleanup_workflow(&workflow_uuid).await;
}

#[tokio::test]
async fn test_handle_status_snapshot() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let handle = ctx
        .executor
        .workflow(
            "noop",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .expect("workflow starts");
    let _: i64 = handle.result().await.expect("workflow result");

    let status = handle
        .status()
        .await
        .expect("status query")
        .expect("row exists");
    assert_eq!(status.workflow_uuid, workflow_uuid);
    assert_eq!(status.name, "noop");
    assert_eq!(status.recovery_attempts, 0);

    // Unknown UUIDs resolve to no snapshot rather than an error.
    let ghost = ctx.executor.retrieve_workflow(&Uuid::new_v4().to_string());
    assert!(ghost.status().await.expect("status query").is_none());

    ctx.cleanup_workflow(&workflow_uuid).await;
}

#[tokio::test]
async fn test_purge_deletes_all_recorded_state() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };

    let workflow_uuid = Uuid::new_v4().to_string();
    let handle = ctx
        .executor
        .workflow(
            "noop",
            WorkflowParams {
                workflow_uuid: Some(workflow_uuid.clone()),
                ..Default::default()
            },
            vec![],
        )
        .await
        .expect("workflow starts");
    let _: i64 = handle.result().await.expect("workflow result");
    ctx.flush().await;
    assert!(ctx.workflow_status(&workflow_uuid).await.is_some());

    ctx.executor
        .purge_workflow(&workflow_uuid)
        .await
        .expect("purge succeeds");
    assert!(ctx.workflow_status(&workflow_uuid).await.is_none());

    let inputs = ctx
        .executor
        .system_db()
        .get_workflow_inputs(&workflow_uuid)
        .await
        .expect("inputs query");
    assert!(inputs.is_none());
}

#[tokio::test]
async fn test_health_check() {
    skip_if_no_db!();
    let Some(ctx) = TestContext::new(test_registry()).await else {
        return;
    };
    assert!(ctx
        .executor
        .system_db()
        .health_check()
        .await
        .expect("health probe"));
}
