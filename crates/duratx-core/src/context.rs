// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation workflow context.
//!
//! Drives sequential execution of one workflow body. The context assigns a
//! monotonically increasing function id to every step and performs the
//! once-and-only-once check before executing it: a recorded output is
//! returned (or a recorded error rethrown) without re-running the step.
//!
//! Step ordering is the program order of the user code; replays must
//! observe the same function-id sequence, which is the user's obligation.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgConnection;
use tracing::{debug, warn};

use crate::config::Config;
use crate::debug;
use crate::error::{DuraError, Result};
use crate::executor::Executor;
use crate::handle::WorkflowHandle;
use crate::registry::{Operation, OperationHandler};
use crate::sysdb::is_serialization_failure;
use crate::types::{epoch_millis, WorkflowIdentity};
use crate::userdb;

/// Base delay between retries of a serialization failure.
const SERIALIZATION_RETRY_BASE_MS: u64 = 10;

/// Cap on the serialization-failure retry delay.
const SERIALIZATION_RETRY_MAX_MS: u64 = 1_000;

/// How the context executes steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecutionMode {
    /// Execute steps and record their outputs.
    Normal,
    /// Consume recorded outputs; never execute side effects.
    Replay,
}

struct ContextInner {
    executor: Executor,
    workflow_uuid: String,
    identity: WorkflowIdentity,
    request: Option<Value>,
    function_counter: AtomicI32,
    mode: ExecutionMode,
    // Outputs of read-only transactions, held back until the next write
    // transaction (or workflow completion) persists them.
    result_buffer: std::sync::Mutex<std::collections::BTreeMap<i32, Value>>,
}

/// The context threaded through a workflow body.
///
/// Cloning is cheap; all clones share the same function-id counter, so the
/// body must remain a single sequential procedure.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub(crate) fn new(
        executor: Executor,
        workflow_uuid: String,
        identity: WorkflowIdentity,
        request: Option<Value>,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                executor,
                workflow_uuid,
                identity,
                request,
                function_counter: AtomicI32::new(0),
                mode,
                result_buffer: std::sync::Mutex::new(std::collections::BTreeMap::new()),
            }),
        }
    }

    /// The UUID this invocation runs under.
    pub fn workflow_uuid(&self) -> &str {
        &self.inner.workflow_uuid
    }

    /// The authenticated user recorded with this workflow, if any.
    pub fn authenticated_user(&self) -> Option<&str> {
        self.inner.identity.authenticated_user.as_deref()
    }

    /// The role this invocation runs under, if any.
    pub fn assumed_role(&self) -> Option<&str> {
        self.inner.identity.assumed_role.as_deref()
    }

    /// The full identity recorded with this workflow.
    pub fn identity(&self) -> &WorkflowIdentity {
        &self.inner.identity
    }

    /// The opaque request recorded at first invocation, re-presented
    /// verbatim on recovery and replay.
    pub fn request(&self) -> Option<&Value> {
        self.inner.request.as_ref()
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.inner.mode == ExecutionMode::Replay
    }

    fn next_function_id(&self) -> i32 {
        self.inner.function_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Cancellation is observed at step boundaries; every step begins with
    /// a database round-trip anyway.
    async fn check_cancellation(&self) -> Result<()> {
        if self.is_replay() {
            return Ok(());
        }
        if self
            .executor()
            .system_db()
            .is_cancelled(self.workflow_uuid())
            .await?
        {
            return Err(DuraError::WorkflowCancelled {
                workflow_uuid: self.workflow_uuid().to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Step entry points
    // ========================================================================

    /// Run the registered transaction step `name`.
    pub async fn transaction<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let op = self.executor().lookup_transaction(name)?;
        let output = self.run_transaction_op(&op, encode_args(args)?).await?;
        decode_output(output)
    }

    /// Run the registered communicator step `name`.
    pub async fn communicator<A, R>(&self, name: &str, args: A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let op = self.executor().lookup_communicator(name)?;
        let output = self.run_communicator_op(&op, encode_args(args)?).await?;
        decode_output(output)
    }

    /// Start the registered workflow `name` as a child of this one.
    ///
    /// The child's UUID derives from this workflow's UUID and the step's
    /// function id, so a replayed parent binds to the same child.
    pub async fn child_workflow<A>(&self, name: &str, args: A) -> Result<WorkflowHandle>
    where
        A: Serialize,
    {
        let fid = self.next_function_id();
        let child_uuid = format!("{}-{}", self.workflow_uuid(), fid);
        if self.is_replay() {
            return debug::replay_child_workflow(self, fid).await;
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        if let Some(record) = sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
        {
            let recorded = record.into_outcome()?;
            let recorded_uuid = recorded
                .get("child_uuid")
                .and_then(Value::as_str)
                .unwrap_or(&child_uuid)
                .to_string();
            return Ok(self.executor().retrieve_workflow(&recorded_uuid));
        }
        sysdb
            .record_operation_output(self.workflow_uuid(), fid, &json!({ "child_uuid": child_uuid }))
            .await?;

        let params = crate::types::WorkflowParams {
            workflow_uuid: Some(child_uuid),
            identity: self.inner.identity.clone(),
            request: self.inner.request.clone(),
            config_name: None,
        };
        self.executor()
            .workflow(name, params, encode_args(args)?)
            .await
    }

    /// Send a message to another workflow's queue, exactly once.
    pub async fn send<M: Serialize>(
        &self,
        destination_uuid: &str,
        message: M,
        topic: Option<&str>,
    ) -> Result<()> {
        let fid = self.next_function_id();
        if self.is_replay() {
            return debug::replay_recorded_unit(self, fid, "send").await;
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        if sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
            .is_some()
        {
            debug!(workflow_uuid = %self.workflow_uuid(), fid, "send already recorded");
            return Ok(());
        }
        let message = serde_json::to_value(message)?;
        sysdb
            .send(self.workflow_uuid(), fid, destination_uuid, &message, topic)
            .await
    }

    /// Receive the oldest message on this workflow's queue for `topic`,
    /// waiting up to `timeout_seconds`. Returns `None` on timeout; the
    /// timeout itself is a recorded outcome.
    pub async fn recv<R: DeserializeOwned>(
        &self,
        topic: Option<&str>,
        timeout_seconds: u64,
    ) -> Result<Option<R>> {
        let fid = self.next_function_id();
        if self.is_replay() {
            let recorded = debug::replay_recorded_value(self, fid, "recv").await?;
            return decode_optional(recorded);
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        if let Some(record) = sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
        {
            return decode_optional(record.into_outcome()?);
        }
        let received = sysdb
            .recv(
                self.workflow_uuid(),
                fid,
                topic,
                Duration::from_secs(timeout_seconds),
            )
            .await?;
        match received {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Publish `(key, value)` for this workflow, at most once per key.
    /// Publishing the same key twice fails with `DuplicateWorkflowEvent`.
    pub async fn set_event<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        let fid = self.next_function_id();
        if self.is_replay() {
            return debug::replay_recorded_unit(self, fid, "set_event").await;
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        if sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let value = serde_json::to_value(value)?;
        sysdb
            .set_event(self.workflow_uuid(), fid, key, &value)
            .await
    }

    /// Read the event `key` published by `target_uuid`, waiting up to
    /// `timeout_seconds`. A timeout records `null` and returns `None`.
    pub async fn get_event<R: DeserializeOwned>(
        &self,
        target_uuid: &str,
        key: &str,
        timeout_seconds: u64,
    ) -> Result<Option<R>> {
        let fid = self.next_function_id();
        if self.is_replay() {
            let recorded = debug::replay_recorded_value(self, fid, "get_event").await?;
            return decode_optional(recorded);
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        if let Some(record) = sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
        {
            return decode_optional(record.into_outcome()?);
        }
        let value = sysdb
            .get_event(
                target_uuid,
                key,
                Duration::from_secs(timeout_seconds),
                Some((self.workflow_uuid(), fid)),
            )
            .await?;
        match value {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Durable sleep. The scheduled wake time is recorded on first
    /// execution, so a recovered body sleeps only the remaining time.
    pub async fn sleep(&self, seconds: u64) -> Result<()> {
        let fid = self.next_function_id();
        if self.is_replay() {
            return debug::replay_recorded_unit(self, fid, "sleep").await;
        }
        self.check_cancellation().await?;

        let sysdb = self.executor().system_db();
        let wake_time_ms = match sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
        {
            Some(record) => {
                let recorded = record.into_outcome()?;
                recorded
                    .get("wake_time_ms")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(epoch_millis)
            }
            None => {
                let wake_time_ms = epoch_millis() + (seconds as i64) * 1_000;
                sysdb
                    .record_operation_output(
                        self.workflow_uuid(),
                        fid,
                        &json!({ "wake_time_ms": wake_time_ms }),
                    )
                    .await?;
                wake_time_ms
            }
        };
        let remaining_ms = wake_time_ms - epoch_millis();
        if remaining_ms > 0 {
            tokio::time::sleep(Duration::from_millis(remaining_ms as u64)).await;
        }
        Ok(())
    }

    // ========================================================================
    // Step execution
    // ========================================================================

    /// Dispatch a single registered step. Used by the temp-workflow
    /// wrappers and recovery.
    pub(crate) async fn invoke_operation(&self, op: &Operation, args: Vec<Value>) -> Result<Value> {
        match &op.handler {
            OperationHandler::Transaction(_) => self.run_transaction_op(op, args).await,
            OperationHandler::Communicator(_) => self.run_communicator_op(op, args).await,
            _ => Err(DuraError::NotRegistered {
                name: op.name.clone(),
            }),
        }
    }

    /// Run one transaction step: open a user-database transaction at the
    /// configured isolation level, probe for a recorded output on the same
    /// connection, run the body, and co-commit the output row with the
    /// user's effects. Serialization failures retry the whole transaction;
    /// a second duplicate-key conflict surfaces as a workflow conflict.
    pub(crate) async fn run_transaction_op(
        &self,
        op: &Operation,
        args: Vec<Value>,
    ) -> Result<Value> {
        let fid = self.next_function_id();
        if self.is_replay() {
            return debug::replay_transaction(self, op, fid, args).await;
        }
        self.check_cancellation().await?;

        let handler = match &op.handler {
            OperationHandler::Transaction(f) => f.clone(),
            _ => {
                return Err(DuraError::NotRegistered {
                    name: op.name.clone(),
                })
            }
        };
        let udb = self.executor().user_db();
        let mut conflict_retried = false;
        let mut retry_delay = Duration::from_millis(SERIALIZATION_RETRY_BASE_MS);

        loop {
            let mut tx = udb.begin(&op.transaction_config).await?;

            if let Some(record) =
                userdb::check_transaction_output(&mut *tx, self.workflow_uuid(), fid).await?
            {
                tx.commit().await?;
                return record.into_outcome();
            }

            let tctx = TransactionContext {
                client: &mut *tx,
                workflow_uuid: self.workflow_uuid().to_string(),
                function_id: fid,
                identity: self.inner.identity.clone(),
            };
            match handler(tctx, args.clone()).await {
                Ok(output) => {
                    if op.transaction_config.read_only {
                        // Held back until the next write transaction (or
                        // workflow completion) persists it.
                        tx.commit().await?;
                        self.inner
                            .result_buffer
                            .lock()
                            .expect("result buffer mutex poisoned")
                            .insert(fid, output.clone());
                        return Ok(output);
                    }

                    let buffered = self.drain_result_buffer();
                    let recorded = async {
                        userdb::record_buffered_outputs(
                            &mut *tx,
                            self.workflow_uuid(),
                            &buffered,
                        )
                        .await?;
                        userdb::record_transaction_output(
                            &mut *tx,
                            self.workflow_uuid(),
                            fid,
                            &output,
                        )
                        .await
                    }
                    .await;
                    if let Err(e) = recorded {
                        drop(tx);
                        self.restore_result_buffer(buffered);
                        if is_serialization_failure(&e) {
                            retry_delay = backoff(retry_delay).await;
                            continue;
                        }
                        if crate::sysdb::is_unique_violation(&e) {
                            if conflict_retried {
                                return Err(DuraError::WorkflowConflict {
                                    workflow_uuid: self.workflow_uuid().to_string(),
                                });
                            }
                            conflict_retried = true;
                            continue;
                        }
                        return Err(e.into());
                    }
                    match tx.commit().await {
                        Ok(()) => return Ok(output),
                        Err(e) => {
                            self.restore_result_buffer(buffered);
                            if is_serialization_failure(&e) {
                                retry_delay = backoff(retry_delay).await;
                                continue;
                            }
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => {
                    drop(tx);
                    if e.is_serialization_failure() {
                        debug!(
                            workflow_uuid = %self.workflow_uuid(),
                            fid,
                            "Serialization failure in transaction body, retrying"
                        );
                        retry_delay = backoff(retry_delay).await;
                        continue;
                    }
                    udb.record_transaction_error(self.workflow_uuid(), fid, &e)
                        .await?;
                    return Err(e);
                }
            }
        }
    }

    fn drain_result_buffer(&self) -> Vec<(i32, Value)> {
        let mut buffer = self
            .inner
            .result_buffer
            .lock()
            .expect("result buffer mutex poisoned");
        std::mem::take(&mut *buffer).into_iter().collect()
    }

    fn restore_result_buffer(&self, entries: Vec<(i32, Value)>) {
        let mut buffer = self
            .inner
            .result_buffer
            .lock()
            .expect("result buffer mutex poisoned");
        for (fid, output) in entries {
            buffer.entry(fid).or_insert(output);
        }
    }

    /// Persist read-only outputs that no later write transaction carried.
    /// Called once when the workflow body finishes. Failure is tolerated:
    /// read-only steps are harmless to re-execute.
    pub(crate) async fn flush_result_buffer(&self) {
        let buffered = self.drain_result_buffer();
        if buffered.is_empty() || self.is_replay() {
            return;
        }
        let udb = self.executor().user_db();
        let result: Result<()> = async {
            let mut tx = udb.begin(&Default::default()).await?;
            userdb::record_buffered_outputs(&mut *tx, self.workflow_uuid(), &buffered)
                .await
                .map_err(DuraError::from)?;
            tx.commit().await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            warn!(
                workflow_uuid = %self.workflow_uuid(),
                error = %e,
                "Failed to persist read-only step outputs"
            );
        }
    }

    /// Run one communicator step under its retry policy. The recorded
    /// output short-circuits replays; side effects outside the database are
    /// tolerated because of it.
    pub(crate) async fn run_communicator_op(
        &self,
        op: &Operation,
        args: Vec<Value>,
    ) -> Result<Value> {
        let fid = self.next_function_id();
        if self.is_replay() {
            return debug::replay_recorded_value(self, fid, "communicator").await;
        }
        self.check_cancellation().await?;

        let handler = match &op.handler {
            OperationHandler::Communicator(f) => f.clone(),
            _ => {
                return Err(DuraError::NotRegistered {
                    name: op.name.clone(),
                })
            }
        };
        let sysdb = self.executor().system_db();
        if let Some(record) = sysdb
            .check_operation_output(self.workflow_uuid(), fid)
            .await?
        {
            return record.into_outcome();
        }

        let policy = &op.retry_policy;
        let max_attempts = if policy.retries_allowed {
            policy.max_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let cctx = CommunicatorContext {
                workflow_uuid: self.workflow_uuid().to_string(),
                function_id: fid,
                attempt,
            };
            match handler(cctx, args.clone()).await {
                Ok(output) => {
                    sysdb
                        .record_operation_output(self.workflow_uuid(), fid, &output)
                        .await?;
                    return Ok(output);
                }
                Err(e) if attempt < max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        workflow_uuid = %self.workflow_uuid(),
                        fid,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Communicator attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    sysdb
                        .record_operation_error(self.workflow_uuid(), fid, &e)
                        .await?;
                    return Err(e);
                }
            }
        }
    }
}

async fn backoff(delay: Duration) -> Duration {
    tokio::time::sleep(delay).await;
    (delay * 2).min(Duration::from_millis(SERIALIZATION_RETRY_MAX_MS))
}

impl DuraError {
    /// Whether this error wraps a PostgreSQL serialization failure that the
    /// engine should transparently retry.
    pub(crate) fn is_serialization_failure(&self) -> bool {
        matches!(self, DuraError::Database { code: Some(code), .. } if code == "40001")
    }
}

/// Context handed to a transaction step body. Exposes the open
/// user-database transaction so the step's queries join it.
pub struct TransactionContext<'c> {
    /// The open transaction against the user database.
    pub client: &'c mut PgConnection,
    /// The surrounding workflow's UUID.
    pub workflow_uuid: String,
    /// This step's function id.
    pub function_id: i32,
    /// Identity of the surrounding workflow invocation.
    pub identity: WorkflowIdentity,
}

/// Context handed to a communicator step body.
#[derive(Debug, Clone)]
pub struct CommunicatorContext {
    /// The surrounding workflow's UUID.
    pub workflow_uuid: String,
    /// This step's function id.
    pub function_id: i32,
    /// The current attempt, 1-indexed.
    pub attempt: u32,
}

/// Context handed to initializers at executor start.
#[derive(Debug, Clone)]
pub struct InitContext {
    /// The engine configuration.
    pub config: Config,
}

/// Serialize user arguments into the positional JSON row the registry
/// handlers consume. Tuples become arrays; a single bare value becomes a
/// one-element row.
pub(crate) fn encode_args<A: Serialize>(args: A) -> Result<Vec<Value>> {
    match serde_json::to_value(args)? {
        Value::Array(values) => Ok(values),
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![other]),
    }
}

fn decode_output<R: DeserializeOwned>(output: Value) -> Result<R> {
    serde_json::from_value(output).map_err(DuraError::from)
}

fn decode_optional<R: DeserializeOwned>(value: Value) -> Result<Option<R>> {
    if value.is_null() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_value(value)?))
}
