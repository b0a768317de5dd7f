// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The executor: registration facade, workflow start/resume/recover, and
//! the background machinery (notification listener, status-buffer flush).
//!
//! An [`Executor`] is built once at process start via [`ExecutorBuilder`],
//! which connects the pools, migrates the system schema, runs registered
//! initializers, and spawns the background tasks. Handles it returns stay
//! valid for the life of the process; [`Executor::destroy`] shuts down
//! gracefully, awaiting in-flight workflows and a final buffer flush.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::{ExecutionMode, InitContext, WorkflowContext};
use crate::debug::DebugProxy;
use crate::error::{DuraError, Result};
use crate::handle::WorkflowHandle;
use crate::migrations;
use crate::registry::{Operation, OperationHandler, OperationKind, Registry};
use crate::sysdb::notifications::run_listener;
use crate::sysdb::SystemDatabase;
use crate::types::{ListWorkflowsFilter, WorkflowIdentity, WorkflowParams};
use crate::userdb::UserDatabase;

/// Status-row name prefix of a single-transaction temp workflow.
const TEMP_TRANSACTION_PREFIX: &str = "temp_workflow-transaction-";

/// Status-row name prefix of a single-communicator temp workflow.
const TEMP_COMMUNICATOR_PREFIX: &str = "temp_workflow-external-";

/// Status-row name of a direct send temp workflow.
const TEMP_SEND_NAME: &str = "temp_workflow-send";

/// How long [`Executor::destroy`] waits for in-flight workflows.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Builder for an [`Executor`].
pub struct ExecutorBuilder {
    config: Option<Config>,
    registry: Registry,
    system_pool: Option<PgPool>,
    user_pool: Option<PgPool>,
    debug_proxy: Option<Arc<dyn DebugProxy>>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            config: None,
            registry: Registry::default(),
            system_pool: None,
            user_pool: None,
            debug_proxy: None,
        }
    }
}

impl ExecutorBuilder {
    /// Set the engine configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the operation registry.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Inject a pre-built system-database pool instead of connecting from
    /// the configuration. Used by tests.
    pub fn system_pool(mut self, pool: PgPool) -> Self {
        self.system_pool = Some(pool);
        self
    }

    /// Inject a pre-built user-database pool instead of connecting from
    /// the configuration. Used by tests.
    pub fn user_pool(mut self, pool: PgPool) -> Self {
        self.user_pool = Some(pool);
        self
    }

    /// Install a replay proxy that receives each recorded transaction's
    /// snapshot coordinates during debug re-execution.
    pub fn debug_proxy(mut self, proxy: Arc<dyn DebugProxy>) -> Self {
        self.debug_proxy = Some(proxy);
        self
    }

    /// Connect the databases, bring the system schema up to date, run
    /// registered initializers, and start the background tasks.
    pub async fn start(self) -> Result<Executor> {
        let config = self.config.ok_or_else(|| DuraError::Initialization {
            reason: "config is required".to_string(),
        })?;

        let system_pool = match self.system_pool {
            Some(pool) => pool,
            None => PgPoolOptions::new()
                .max_connections(config.pool_size)
                .connect_with(config.system_connect_options())
                .await
                .map_err(|e| DuraError::Initialization {
                    reason: format!("system database connection failed: {}", e),
                })?,
        };
        let user_pool = match self.user_pool {
            Some(pool) => pool,
            None => PgPoolOptions::new()
                .max_connections(config.pool_size)
                .connect_with(config.user_connect_options())
                .await
                .map_err(|e| DuraError::Initialization {
                    reason: format!("user database connection failed: {}", e),
                })?,
        };

        migrations::run_system(&system_pool)
            .await
            .map_err(|e| DuraError::Initialization {
                reason: format!("system schema migration failed: {}", e),
            })?;
        migrations::ensure_user_schema(&user_pool)
            .await
            .map_err(|e| DuraError::Initialization {
                reason: format!("user schema setup failed: {}", e),
            })?;

        let executor = Executor {
            inner: Arc::new(ExecutorInner {
                sysdb: SystemDatabase::new(system_pool.clone()),
                userdb: UserDatabase::new(user_pool),
                registry: self.registry,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                background: Mutex::new(Vec::new()),
                debug_proxy: self.debug_proxy,
                config,
            }),
        };

        for initializer in executor.inner.registry.initializers() {
            initializer(InitContext {
                config: executor.inner.config.clone(),
            })
            .await?;
        }

        let listener = tokio::spawn(run_listener(
            system_pool,
            executor.inner.sysdb.dispatcher(),
            executor.inner.shutdown.child_token(),
        ));
        let flusher = tokio::spawn(run_flush_loop(
            executor.clone(),
            executor.inner.shutdown.child_token(),
        ));
        executor
            .inner
            .background
            .lock()
            .expect("background task mutex poisoned")
            .extend([listener, flusher]);

        info!(
            executor_id = %executor.inner.config.executor_id,
            operations = executor.inner.registry.len(),
            "Executor started"
        );
        Ok(executor)
    }
}

struct ExecutorInner {
    config: Config,
    registry: Registry,
    sysdb: SystemDatabase,
    userdb: UserDatabase,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    background: Mutex<Vec<JoinHandle<()>>>,
    debug_proxy: Option<Arc<dyn DebugProxy>>,
}

/// The workflow execution engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Create a new builder.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The system database.
    pub fn system_db(&self) -> &SystemDatabase {
        &self.inner.sysdb
    }

    /// The user database.
    pub fn user_db(&self) -> &UserDatabase {
        &self.inner.userdb
    }

    pub(crate) fn debug_proxy(&self) -> Option<&Arc<dyn DebugProxy>> {
        self.inner.debug_proxy.as_ref()
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Start the registered workflow `name`.
    ///
    /// Atomically records the PENDING status and the inputs, spawns the
    /// body, and returns a handle without awaiting completion. A duplicate
    /// call with the same UUID replays the first-committed inputs and both
    /// callers observe the same eventual result through their handles.
    pub async fn workflow(
        &self,
        name: &str,
        mut params: WorkflowParams,
        args: Vec<Value>,
    ) -> Result<WorkflowHandle> {
        let op = self.lookup(name, OperationKind::Workflow)?;
        params.identity.assumed_role = self.resolve_role(&op, &params.identity)?;

        let workflow_uuid = params
            .workflow_uuid
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let committed_args = self
            .init_status(&workflow_uuid, name, &op, &params, &args)
            .await?;

        self.spawn_workflow(
            op,
            workflow_uuid.clone(),
            params.identity,
            params.request,
            committed_args,
        );
        Ok(self.retrieve_workflow(&workflow_uuid))
    }

    /// Run a single transaction step as a temp workflow and await its
    /// result.
    pub async fn transaction(
        &self,
        name: &str,
        params: WorkflowParams,
        args: Vec<Value>,
    ) -> Result<Value> {
        let op = self.lookup(name, OperationKind::Transaction)?;
        let temp_name = format!("{}{}", TEMP_TRANSACTION_PREFIX, name);
        self.run_temp(op, &temp_name, params, args).await
    }

    /// Run a single communicator step as a temp workflow and await its
    /// result.
    pub async fn external(
        &self,
        name: &str,
        params: WorkflowParams,
        args: Vec<Value>,
    ) -> Result<Value> {
        let op = self.lookup(name, OperationKind::Communicator)?;
        let temp_name = format!("{}{}", TEMP_COMMUNICATOR_PREFIX, name);
        self.run_temp(op, &temp_name, params, args).await
    }

    /// Send a message to a workflow from outside any workflow. The
    /// idempotency key, when given, makes repeat sends no-ops.
    pub async fn send(
        &self,
        destination_uuid: &str,
        message: Value,
        topic: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        let workflow_uuid = idempotency_key
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let args = vec![
            Value::String(destination_uuid.to_string()),
            message,
            topic.map(|t| Value::String(t.to_string())).unwrap_or(Value::Null),
        ];

        let identity = WorkflowIdentity::default();
        let committed = self
            .inner
            .sysdb
            .init_workflow_status(
                &workflow_uuid,
                TEMP_SEND_NAME,
                "",
                None,
                &identity,
                None,
                &self.inner.config.executor_id,
                self.inner.config.application_version.as_deref(),
                &args,
            )
            .await?;
        match self.inner.sysdb.check_workflow_output(&workflow_uuid).await {
            Ok(Some(_)) => return Ok(()),
            Err(e) => return Err(e),
            Ok(None) => {}
        }

        let ctx = self.context(&workflow_uuid, identity, None, ExecutionMode::Normal);
        match send_from_args(&ctx, &committed).await {
            Ok(()) => {
                self.inner
                    .sysdb
                    .buffer_workflow_output(&workflow_uuid, Value::Null);
                Ok(())
            }
            Err(e) => {
                self.record_failure(&workflow_uuid, &e).await;
                Err(e)
            }
        }
    }

    /// Read an event published by `workflow_uuid`, waiting up to
    /// `timeout_seconds`.
    pub async fn get_event(
        &self,
        workflow_uuid: &str,
        key: &str,
        timeout_seconds: u64,
    ) -> Result<Option<Value>> {
        self.inner
            .sysdb
            .get_event(
                workflow_uuid,
                key,
                Duration::from_secs(timeout_seconds),
                None,
            )
            .await
    }

    /// A handle to an existing workflow.
    pub fn retrieve_workflow(&self, workflow_uuid: &str) -> WorkflowHandle {
        WorkflowHandle::new(self.clone(), workflow_uuid.to_string())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Resume every PENDING workflow owned by the given executor
    /// identities (default: this executor). Each resumed workflow's
    /// recovery counter is bumped first; workflows at the limit move to the
    /// dead-letter state instead of running again.
    pub async fn recover_pending_workflows(
        &self,
        executor_ids: Option<Vec<String>>,
    ) -> Result<Vec<WorkflowHandle>> {
        let ids = executor_ids
            .unwrap_or_else(|| vec![self.inner.config.executor_id.clone()]);
        let max_attempts = self.inner.config.max_recovery_attempts as i64;
        let mut handles = Vec::new();

        for executor_id in &ids {
            let pending = self
                .inner
                .sysdb
                .get_pending_workflows(
                    executor_id,
                    self.inner.config.application_version.as_deref(),
                )
                .await?;
            info!(executor_id = %executor_id, count = pending.len(), "Recovering pending workflows");

            for workflow_uuid in pending {
                let attempts = self
                    .inner
                    .sysdb
                    .increment_recovery_attempts(&workflow_uuid)
                    .await?;
                if attempts >= max_attempts {
                    warn!(
                        workflow_uuid = %workflow_uuid,
                        attempts,
                        "Workflow reached its recovery limit, dead-lettering"
                    );
                    self.inner.sysdb.mark_retries_exceeded(&workflow_uuid).await?;
                    continue;
                }
                match self.execute_workflow_uuid(&workflow_uuid).await {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        warn!(workflow_uuid = %workflow_uuid, error = %e, "Failed to resume workflow")
                    }
                }
            }
        }
        Ok(handles)
    }

    /// Re-invoke a workflow by UUID with its recorded identity, request,
    /// and inputs. Used by recovery, tests, and the admin surface.
    pub async fn execute_workflow_uuid(&self, workflow_uuid: &str) -> Result<WorkflowHandle> {
        let status = self
            .inner
            .sysdb
            .get_workflow_status(workflow_uuid)
            .await?
            .ok_or_else(|| DuraError::WorkflowNotFound {
                workflow_uuid: workflow_uuid.to_string(),
            })?;
        let inputs = self
            .inner
            .sysdb
            .get_workflow_inputs(workflow_uuid)
            .await?
            .ok_or_else(|| DuraError::WorkflowNotFound {
                workflow_uuid: workflow_uuid.to_string(),
            })?;
        let identity = status.identity();
        let request: Option<Value> = status
            .request
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        if let Some(op_name) = status.name.strip_prefix(TEMP_TRANSACTION_PREFIX) {
            let op = self.lookup(op_name, OperationKind::Transaction)?;
            return Ok(self.spawn_temp_resume(op, workflow_uuid, identity, request, inputs));
        }
        if let Some(op_name) = status.name.strip_prefix(TEMP_COMMUNICATOR_PREFIX) {
            let op = self.lookup(op_name, OperationKind::Communicator)?;
            return Ok(self.spawn_temp_resume(op, workflow_uuid, identity, request, inputs));
        }
        if status.name == TEMP_SEND_NAME {
            return Ok(self.spawn_send_resume(workflow_uuid, identity, inputs));
        }

        let op = self.lookup(&status.name, OperationKind::Workflow)?;
        self.spawn_workflow(op, workflow_uuid.to_string(), identity, request, inputs);
        Ok(self.retrieve_workflow(workflow_uuid))
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    /// Cancel a non-terminal workflow. The in-flight body observes the
    /// cancellation at its next step boundary.
    pub async fn cancel_workflow(&self, workflow_uuid: &str) -> Result<()> {
        self.inner.sysdb.cancel_workflow(workflow_uuid).await
    }

    /// List workflow UUIDs matching the filter.
    pub async fn get_workflows(&self, filter: &ListWorkflowsFilter) -> Result<Vec<String>> {
        self.inner.sysdb.get_workflows(filter).await
    }

    /// Delete all recorded state of one workflow.
    pub async fn purge_workflow(&self, workflow_uuid: &str) -> Result<()> {
        self.inner.sysdb.purge_workflow(workflow_uuid).await
    }

    // ========================================================================
    // Debug replay
    // ========================================================================

    /// Re-execute a recorded workflow in replay mode and return its output.
    /// Steps consume recorded rows and never fire new side effects.
    pub async fn debug_workflow(&self, workflow_uuid: &str) -> Result<Value> {
        let status = self
            .inner
            .sysdb
            .get_workflow_status(workflow_uuid)
            .await?
            .ok_or_else(|| DuraError::WorkflowNotFound {
                workflow_uuid: workflow_uuid.to_string(),
            })?;
        let inputs = self
            .inner
            .sysdb
            .get_workflow_inputs(workflow_uuid)
            .await?
            .ok_or_else(|| DuraError::WorkflowNotFound {
                workflow_uuid: workflow_uuid.to_string(),
            })?;
        let identity = status.identity();
        let request: Option<Value> = status
            .request
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let ctx = self.context(workflow_uuid, identity, request, ExecutionMode::Replay);

        if let Some(op_name) = status.name.strip_prefix(TEMP_TRANSACTION_PREFIX) {
            let op = self.lookup(op_name, OperationKind::Transaction)?;
            return ctx.invoke_operation(&op, inputs).await;
        }
        if let Some(op_name) = status.name.strip_prefix(TEMP_COMMUNICATOR_PREFIX) {
            let op = self.lookup(op_name, OperationKind::Communicator)?;
            return ctx.invoke_operation(&op, inputs).await;
        }

        let op = self.lookup(&status.name, OperationKind::Workflow)?;
        let handler = match &op.handler {
            OperationHandler::Workflow(f) => f.clone(),
            _ => {
                return Err(DuraError::NotRegistered {
                    name: op.name.clone(),
                })
            }
        };
        handler(ctx, inputs).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Graceful shutdown: stop background tasks, await in-flight workflows
    /// up to a grace period, flush the status buffer, and close the pools.
    pub async fn destroy(&self) -> Result<()> {
        info!("Executor shutting down...");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!("In-flight workflows did not finish within the grace period");
        }

        let background = {
            let mut guard = self
                .inner
                .background
                .lock()
                .expect("background task mutex poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in background {
            let _ = handle.await;
        }

        if let Err(e) = self.inner.sysdb.flush_workflow_status_buffer().await {
            error!(error = %e, "Final status flush failed");
        }
        self.inner.sysdb.pool().close().await;
        self.inner.userdb.pool().close().await;
        info!("Executor shutdown complete");
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) fn lookup(&self, name: &str, kind: OperationKind) -> Result<Arc<Operation>> {
        match self.inner.registry.get(name) {
            Some(op) if op.kind == kind => Ok(op),
            _ => Err(DuraError::NotRegistered {
                name: name.to_string(),
            }),
        }
    }

    pub(crate) fn lookup_transaction(&self, name: &str) -> Result<Arc<Operation>> {
        self.lookup(name, OperationKind::Transaction)
    }

    pub(crate) fn lookup_communicator(&self, name: &str) -> Result<Arc<Operation>> {
        self.lookup(name, OperationKind::Communicator)
    }

    /// Resolve the role this invocation runs under. Unrestricted operations
    /// keep whatever role the caller supplied; restricted operations
    /// require the identity to hold one of the required roles.
    fn resolve_role(
        &self,
        op: &Operation,
        identity: &WorkflowIdentity,
    ) -> Result<Option<String>> {
        if op.required_roles.is_empty() {
            return Ok(identity.assumed_role.clone());
        }
        if let Some(role) = &identity.assumed_role {
            if op.required_roles.contains(role) {
                return Ok(Some(role.clone()));
            }
            return Err(DuraError::NotAuthorized {
                name: op.name.clone(),
                required_roles: op.required_roles.clone(),
            });
        }
        for role in &identity.authenticated_roles {
            if op.required_roles.contains(role) {
                return Ok(Some(role.clone()));
            }
        }
        Err(DuraError::NotAuthorized {
            name: op.name.clone(),
            required_roles: op.required_roles.clone(),
        })
    }

    async fn init_status(
        &self,
        workflow_uuid: &str,
        name: &str,
        op: &Operation,
        params: &WorkflowParams,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        self.inner
            .sysdb
            .init_workflow_status(
                workflow_uuid,
                name,
                &op.class_name,
                params.config_name.as_deref(),
                &params.identity,
                params.request.as_ref(),
                &self.inner.config.executor_id,
                self.inner.config.application_version.as_deref(),
                args,
            )
            .await
    }

    fn context(
        &self,
        workflow_uuid: &str,
        identity: WorkflowIdentity,
        request: Option<Value>,
        mode: ExecutionMode,
    ) -> WorkflowContext {
        WorkflowContext::new(
            self.clone(),
            workflow_uuid.to_string(),
            identity,
            request,
            mode,
        )
    }

    fn spawn_workflow(
        &self,
        op: Arc<Operation>,
        workflow_uuid: String,
        identity: WorkflowIdentity,
        request: Option<Value>,
        args: Vec<Value>,
    ) {
        let executor = self.clone();
        self.inner.tracker.spawn(async move {
            match executor.inner.sysdb.check_workflow_output(&workflow_uuid).await {
                Ok(None) => {}
                Ok(Some(_)) | Err(_) => {
                    debug!(workflow_uuid = %workflow_uuid, "Workflow already terminal, not re-running");
                    return;
                }
            }
            let handler = match &op.handler {
                OperationHandler::Workflow(f) => f.clone(),
                _ => return,
            };
            let ctx = executor.context(&workflow_uuid, identity, request, ExecutionMode::Normal);
            let result = handler(ctx.clone(), args).await;
            ctx.flush_result_buffer().await;
            executor.finish_workflow(&workflow_uuid, result).await;
        });
    }

    fn spawn_temp_resume(
        &self,
        op: Arc<Operation>,
        workflow_uuid: &str,
        identity: WorkflowIdentity,
        request: Option<Value>,
        args: Vec<Value>,
    ) -> WorkflowHandle {
        let executor = self.clone();
        let uuid = workflow_uuid.to_string();
        self.inner.tracker.spawn(async move {
            match executor.inner.sysdb.check_workflow_output(&uuid).await {
                Ok(None) => {}
                _ => return,
            }
            let ctx = executor.context(&uuid, identity, request, ExecutionMode::Normal);
            let result = ctx.invoke_operation(&op, args).await;
            ctx.flush_result_buffer().await;
            executor.finish_workflow(&uuid, result).await;
        });
        self.retrieve_workflow(workflow_uuid)
    }

    fn spawn_send_resume(
        &self,
        workflow_uuid: &str,
        identity: WorkflowIdentity,
        args: Vec<Value>,
    ) -> WorkflowHandle {
        let executor = self.clone();
        let uuid = workflow_uuid.to_string();
        self.inner.tracker.spawn(async move {
            match executor.inner.sysdb.check_workflow_output(&uuid).await {
                Ok(None) => {}
                _ => return,
            }
            let ctx = executor.context(&uuid, identity, None, ExecutionMode::Normal);
            let result = send_from_args(&ctx, &args).await;
            executor
                .finish_workflow(&uuid, result.map(|_| Value::Null))
                .await;
        });
        self.retrieve_workflow(workflow_uuid)
    }

    async fn run_temp(
        &self,
        op: Arc<Operation>,
        temp_name: &str,
        mut params: WorkflowParams,
        args: Vec<Value>,
    ) -> Result<Value> {
        params.identity.assumed_role = self.resolve_role(&op, &params.identity)?;
        let workflow_uuid = params
            .workflow_uuid
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let committed_args = self
            .init_status(&workflow_uuid, temp_name, &op, &params, &args)
            .await?;
        match self.inner.sysdb.check_workflow_output(&workflow_uuid).await {
            Ok(Some(output)) => return Ok(output),
            Err(e) => return Err(e),
            Ok(None) => {}
        }

        let ctx = self.context(
            &workflow_uuid,
            params.identity,
            params.request,
            ExecutionMode::Normal,
        );
        let result = ctx.invoke_operation(&op, committed_args).await;
        ctx.flush_result_buffer().await;
        match &result {
            Ok(output) => self
                .inner
                .sysdb
                .buffer_workflow_output(&workflow_uuid, output.clone()),
            Err(e) => self.record_failure(&workflow_uuid, e).await,
        }
        result
    }

    async fn finish_workflow(&self, workflow_uuid: &str, result: Result<Value>) {
        match result {
            Ok(output) => self
                .inner
                .sysdb
                .buffer_workflow_output(workflow_uuid, output),
            Err(DuraError::WorkflowCancelled { .. }) => {
                debug!(workflow_uuid = %workflow_uuid, "Workflow observed cancellation");
            }
            Err(e) => self.record_failure(workflow_uuid, &e).await,
        }
    }

    async fn record_failure(&self, workflow_uuid: &str, error: &DuraError) {
        warn!(workflow_uuid = %workflow_uuid, error = %error, "Workflow failed");
        if let Err(record_err) = self
            .inner
            .sysdb
            .record_workflow_error(workflow_uuid, error)
            .await
        {
            error!(
                workflow_uuid = %workflow_uuid,
                error = %record_err,
                "Failed to record workflow error"
            );
        }
    }
}

/// Replay a direct-send temp workflow from its recorded argument row
/// `[destination, message, topic]`.
async fn send_from_args(ctx: &WorkflowContext, args: &[Value]) -> Result<()> {
    let destination = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| DuraError::Serialization {
            details: "send workflow is missing its destination".to_string(),
        })?;
    let message = args.get(1).cloned().unwrap_or(Value::Null);
    let topic = args.get(2).and_then(Value::as_str);
    ctx.send(destination, message, topic).await
}

/// Periodically flush buffered terminal-status writes; a final flush runs
/// on shutdown.
async fn run_flush_loop(executor: Executor, cancel: CancellationToken) {
    let interval = Duration::from_millis(executor.inner.config.flush_interval_ms);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(e) = executor.inner.sysdb.flush_workflow_status_buffer().await {
                    warn!(error = %e, "Shutdown status flush failed");
                }
                break;
            }

            _ = tokio::time::sleep(interval) => {
                if let Err(e) = executor.inner.sysdb.flush_workflow_status_buffer().await {
                    warn!(error = %e, "Periodic status flush failed");
                }
            }
        }
    }
}
