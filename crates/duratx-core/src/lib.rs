// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duratx Core - Durable Workflow Execution Engine
//!
//! This crate turns ordinary async Rust procedures into reliably executed,
//! exactly-once workflows. Intermediate state, inputs, outputs, errors, and
//! inter-workflow signals are persisted to PostgreSQL; if the host process
//! crashes, in-flight workflows resume from their last recorded step and
//! observably complete exactly once per invocation identity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Application Process                          │
//! │                                                                  │
//! │  Registry ──▶ Executor ──▶ WorkflowContext ──▶ user step bodies  │
//! │                  │               │                               │
//! │                  │               ├── transaction steps ────┐     │
//! │                  ▼               ▼                         ▼     │
//! │          SystemDatabase   (OAOO probes)            UserDatabase  │
//! └──────────────────┼─────────────────────────────────────┼────────┘
//!                    ▼                                     ▼
//!        ┌───────────────────────┐             ┌───────────────────────┐
//!        │  system database      │             │  application database │
//!        │  dbos.workflow_status │             │  application tables   │
//!        │  dbos.operation_…     │             │  dbos.transaction_…   │
//!        └───────────────────────┘             └───────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use duratx_core::{Config, Executor, Registry, WorkflowContext, WorkflowParams};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::builder()
//!         .workflow("greet", |ctx: WorkflowContext, (name,): (String,)| async move {
//!             let greeting: String = ctx.communicator("format", (name,)).await?;
//!             Ok(greeting)
//!         })
//!         .communicator("format", Default::default(),
//!             |_ctx, (name,): (String,)| async move { Ok(format!("hello {}", name)) })
//!         .build()?;
//!
//!     let executor = Executor::builder()
//!         .config(Config::from_env()?)
//!         .registry(registry)
//!         .start()
//!         .await?;
//!
//!     let handle = executor
//!         .workflow("greet", WorkflowParams::default(), vec!["world".into()])
//!         .await?;
//!     let greeting: String = handle.result().await?;
//!     println!("{}", greeting);
//!
//!     executor.destroy().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Once-and-Only-Once
//!
//! Every step of a workflow gets a monotonically increasing function id in
//! program order. Before a step runs, its recorded output row is probed by
//! `(workflow_uuid, function_id)`; a hit short-circuits to the recorded
//! value (or rethrows the recorded error) instead of re-executing. For
//! transaction steps, the output row is inserted on the same connection as
//! the user's queries, so the application's effects and the engine's
//! bookkeeping commit atomically.
//!
//! # Workflow Status State Machine
//!
//! ```text
//!            ┌──────────────┐
//!  init  ──▶ │   PENDING    │ ── body completes ──▶ SUCCESS
//!            │              │ ── body throws    ──▶ ERROR
//!            │              │ ── cancel         ──▶ CANCELLED
//!            │              │ ── attempts ≥ max ──▶ RETRIES_EXCEEDED
//!            └──────────────┘
//! ```
//!
//! SUCCESS, ERROR, CANCELLED, and RETRIES_EXCEEDED are terminal and
//! write-once.
//!
//! # Recovery
//!
//! Each process runs under an executor identity (`DBOS__VMID`, default
//! `"local"`). On startup, [`Executor::recover_pending_workflows`] scans
//! for PENDING workflows owned by this identity, bumps their recovery
//! counter, and re-invokes them with their original UUID, identity, and
//! request. Workflows that reach the configured attempt limit move to the
//! RETRIES_EXCEEDED dead-letter state instead.
//!
//! # Modules
//!
//! - [`config`]: engine configuration from environment variables
//! - [`context`]: per-invocation workflow context and step kinds
//! - [`debug`]: replay execution against a recorded stream
//! - [`error`]: unified error type with stable error codes
//! - [`executor`]: engine lifecycle, invocation, and recovery
//! - [`handle`]: workflow handles
//! - [`migrations`]: embedded schema migrations
//! - [`registry`]: operation registration
//! - [`sysdb`]: system-database operations
//! - [`types`]: status, identity, filter, and retry types
//! - [`userdb`]: user-database adapter for transaction steps

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Per-invocation workflow context driving sequential steps.
pub mod context;

/// Replay execution against a recorded operation stream.
pub mod debug;

/// Error types for engine operations.
pub mod error;

/// The executor: registration facade, invocation, recovery, lifecycle.
pub mod executor;

/// Handles to started or retrieved workflows.
pub mod handle;

/// Embedded database migrations.
pub mod migrations;

/// Operation registry and registration builder.
pub mod registry;

/// System-database operations for workflow bookkeeping.
pub mod sysdb;

/// Core types: statuses, identities, records, filters, retry policy.
pub mod types;

/// User-database adapter for transaction steps.
pub mod userdb;

pub use config::{Config, ConfigError};
pub use context::{CommunicatorContext, InitContext, TransactionContext, WorkflowContext};
pub use debug::DebugProxy;
pub use error::{DuraError, Result};
pub use executor::{Executor, ExecutorBuilder};
pub use handle::WorkflowHandle;
pub use registry::{OperationKind, Registry, RegistryBuilder};
pub use sysdb::SystemDatabase;
pub use types::{
    IsolationLevel, ListWorkflowsFilter, RetryPolicy, TransactionConfig, WorkflowIdentity,
    WorkflowParams, WorkflowStatus, WorkflowStatusRecord,
};
pub use userdb::UserDatabase;
