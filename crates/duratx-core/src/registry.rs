// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation registry.
//!
//! Associates each operation name with its kind, configuration, required
//! roles, and handler. Registration happens once at program start through
//! [`RegistryBuilder`]; the built [`Registry`] is immutable and shared by
//! the executor. Identity comparison is by operation name.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::{CommunicatorContext, InitContext, TransactionContext, WorkflowContext};
use crate::error::{DuraError, Result};
use crate::types::{RetryPolicy, TransactionConfig};

/// What kind of operation a registration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A durable workflow body.
    Workflow,
    /// A transactional step against the user database.
    Transaction,
    /// An idempotent external-call step.
    Communicator,
    /// An HTTP handler; registered for completeness, invoked by the routing
    /// layer rather than the engine.
    Handler,
    /// A startup hook run during executor initialization.
    Initializer,
    /// Reserved: a transaction body compiled to run inside the database.
    StoredProcedure,
}

/// Type-erased workflow handler.
pub type WorkflowFn =
    Arc<dyn Fn(WorkflowContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Type-erased transaction handler. The context borrows the open
/// user-database transaction for the duration of the returned future.
pub type TransactionFn = Arc<
    dyn for<'c> Fn(TransactionContext<'c>, Vec<Value>) -> BoxFuture<'c, Result<Value>>
        + Send
        + Sync,
>;

/// Type-erased communicator handler.
pub type CommunicatorFn =
    Arc<dyn Fn(CommunicatorContext, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Type-erased initializer.
pub type InitializerFn =
    Arc<dyn Fn(InitContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// The handler stored for an operation, matching its kind.
#[derive(Clone)]
pub(crate) enum OperationHandler {
    Workflow(WorkflowFn),
    Transaction(TransactionFn),
    Communicator(CommunicatorFn),
    Initializer(InitializerFn),
}

/// One registered operation.
#[derive(Clone)]
pub struct Operation {
    /// Operation name; the lookup key.
    pub name: String,
    /// Class the operation belongs to, recorded in the status row.
    pub class_name: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Transaction configuration; meaningful for transaction steps.
    pub transaction_config: TransactionConfig,
    /// Retry policy; meaningful for communicator steps.
    pub retry_policy: RetryPolicy,
    /// Roles the caller must hold one of. Empty means unrestricted.
    pub required_roles: Vec<String>,
    pub(crate) handler: OperationHandler,
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("kind", &self.kind)
            .field("required_roles", &self.required_roles)
            .finish()
    }
}

/// Immutable registry of operations, shared by the executor.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<HashMap<String, Arc<Operation>>>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up an operation by name.
    pub fn get(&self, name: &str) -> Option<Arc<Operation>> {
        self.inner.get(name).cloned()
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// All registered initializers, run once during executor init.
    pub(crate) fn initializers(&self) -> Vec<InitializerFn> {
        self.inner
            .values()
            .filter_map(|op| match &op.handler {
                OperationHandler::Initializer(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Builder recording operations before the engine starts.
#[derive(Default)]
pub struct RegistryBuilder {
    map: HashMap<String, Arc<Operation>>,
    errors: Vec<String>,
}

/// Deserialize the positional JSON argument row into the user's typed
/// arguments. Tuples map onto JSON arrays, so `(String, i64)` accepts
/// `["a", 1]`.
fn parse_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A> {
    serde_json::from_value(Value::Array(args)).map_err(|e| DuraError::Serialization {
        details: format!("invalid operation arguments: {}", e),
    })
}

fn serialize_output<R: Serialize>(output: R) -> Result<Value> {
    serde_json::to_value(output).map_err(DuraError::from)
}

impl RegistryBuilder {
    /// Register a workflow body under `name`.
    pub fn workflow<A, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(WorkflowContext, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: WorkflowFn = Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = parse_args(args)?;
                serialize_output(f(ctx, args).await?)
            })
        });
        self.insert(name, OperationKind::Workflow, OperationHandler::Workflow(handler))
    }

    /// Register a transaction step under `name`.
    ///
    /// The handler receives a [`TransactionContext`] borrowing the open
    /// user-database transaction; plain `fn` items returning a boxed future
    /// satisfy the bound directly.
    pub fn transaction<A, R, F>(self, name: &str, config: TransactionConfig, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: for<'c> Fn(TransactionContext<'c>, A) -> BoxFuture<'c, Result<R>>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        let handler: TransactionFn = Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = parse_args(args)?;
                serialize_output(f(ctx, args).await?)
            })
        });
        self.insert_with(
            name,
            OperationKind::Transaction,
            OperationHandler::Transaction(handler),
            config,
            RetryPolicy::default(),
        )
    }

    /// Register an idempotent external-call step under `name`.
    pub fn communicator<A, R, F, Fut>(self, name: &str, policy: RetryPolicy, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CommunicatorContext, A) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: CommunicatorFn = Arc::new(move |ctx, args| {
            let f = f.clone();
            Box::pin(async move {
                let args: A = parse_args(args)?;
                serialize_output(f(ctx, args).await?)
            })
        });
        self.insert_with(
            name,
            OperationKind::Communicator,
            OperationHandler::Communicator(handler),
            TransactionConfig::default(),
            policy,
        )
    }

    /// Register a startup hook run during executor initialization.
    pub fn initializer<F, Fut>(self, name: &str, f: F) -> Self
    where
        F: Fn(InitContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: InitializerFn = Arc::new(move |ctx| {
            let f = f.clone();
            Box::pin(async move { f(ctx).await })
        });
        self.insert(name, OperationKind::Initializer, OperationHandler::Initializer(handler))
    }

    /// Restrict an already-registered operation to callers holding one of
    /// `roles`.
    pub fn require_roles(mut self, name: &str, roles: &[&str]) -> Self {
        match self.map.get_mut(name) {
            Some(op) => {
                let mut updated = (**op).clone();
                updated.required_roles = roles.iter().map(|r| r.to_string()).collect();
                *op = Arc::new(updated);
            }
            None => {
                self.errors
                    .push(format!("require_roles: operation '{}' is not registered", name));
            }
        }
        self
    }

    /// Record the class name of an already-registered operation.
    pub fn class_name(mut self, name: &str, class_name: &str) -> Self {
        match self.map.get_mut(name) {
            Some(op) => {
                let mut updated = (**op).clone();
                updated.class_name = class_name.to_string();
                *op = Arc::new(updated);
            }
            None => {
                self.errors
                    .push(format!("class_name: operation '{}' is not registered", name));
            }
        }
        self
    }

    fn insert(self, name: &str, kind: OperationKind, handler: OperationHandler) -> Self {
        self.insert_with(name, kind, handler, TransactionConfig::default(), RetryPolicy::default())
    }

    fn insert_with(
        mut self,
        name: &str,
        kind: OperationKind,
        handler: OperationHandler,
        transaction_config: TransactionConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        if self.map.contains_key(name) {
            self.errors
                .push(format!("operation '{}' registered more than once", name));
            return self;
        }
        self.map.insert(
            name.to_string(),
            Arc::new(Operation {
                name: name.to_string(),
                class_name: String::new(),
                kind,
                transaction_config,
                retry_policy,
                required_roles: Vec::new(),
                handler,
            }),
        );
        self
    }

    /// Finish building. Duplicate names and dangling role annotations are
    /// reported as an initialization error.
    pub fn build(self) -> Result<Registry> {
        if !self.errors.is_empty() {
            return Err(DuraError::Initialization {
                reason: self.errors.join("; "),
            });
        }
        Ok(Registry {
            inner: Arc::new(self.map),
        })
    }
}
