// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle to a started or retrieved workflow.

use serde::de::DeserializeOwned;

use crate::error::Result;
use crate::executor::Executor;
use crate::types::WorkflowStatusRecord;

/// A handle bound to one workflow UUID.
///
/// Handles are cheap to clone and remain valid across process restarts;
/// they read the system database rather than any in-process task state.
#[derive(Clone)]
pub struct WorkflowHandle {
    executor: Executor,
    workflow_uuid: String,
}

impl WorkflowHandle {
    pub(crate) fn new(executor: Executor, workflow_uuid: String) -> Self {
        Self {
            executor,
            workflow_uuid,
        }
    }

    /// The workflow's UUID.
    pub fn workflow_uuid(&self) -> &str {
        &self.workflow_uuid
    }

    /// The current status snapshot, or `None` for an unknown UUID.
    pub async fn status(&self) -> Result<Option<WorkflowStatusRecord>> {
        self.executor
            .system_db()
            .get_workflow_status(&self.workflow_uuid)
            .await
    }

    /// Block until the workflow reaches a terminal state and return its
    /// output. A recorded workflow error is rethrown here.
    pub async fn result<R: DeserializeOwned>(&self) -> Result<R> {
        let output = self
            .executor
            .system_db()
            .get_workflow_result(&self.workflow_uuid)
            .await?;
        Ok(serde_json::from_value(output)?)
    }
}
