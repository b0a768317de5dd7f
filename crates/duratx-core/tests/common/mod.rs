// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for duratx-core E2E tests.
//!
//! Provides TestContext for setting up the database and an executor over
//! it. Tests are skipped entirely when DURATX_TEST_DATABASE_URL is not
//! set.

#![allow(dead_code)]

use sqlx::PgPool;

use duratx_core::{Config, Executor, Registry};

/// Test context holding the shared pool and a running executor.
///
/// The system schema and the user-side `dbos.transaction_outputs` table
/// live in the same test database; the engine keeps them in separate
/// tables, so sharing one database is safe and keeps the harness simple.
pub struct TestContext {
    pub pool: PgPool,
    pub executor: Executor,
}

impl TestContext {
    /// Create a test context with the default configuration.
    pub async fn new(registry: Registry) -> Option<Self> {
        Self::with_config(registry, |_| {}).await
    }

    /// Create a test context, letting the test tweak the configuration
    /// (recovery limits, flush cadence) before the executor starts.
    pub async fn with_config(
        registry: Registry,
        tweak: impl FnOnce(&mut Config),
    ) -> Option<Self> {
        let database_url = std::env::var("DURATX_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url).await.ok()?;

        let mut config = Config::new("localhost", 5432, "postgres", "", "duratx_test");
        config.flush_interval_ms = 100;
        tweak(&mut config);

        let executor = Executor::builder()
            .config(config)
            .registry(registry)
            .system_pool(pool.clone())
            .user_pool(pool.clone())
            .start()
            .await
            .ok()?;

        let ctx = Self { pool, executor };
        ctx.ensure_app_tables().await;
        Some(ctx)
    }

    /// Create the application-side table exercised by transaction steps.
    async fn ensure_app_tables(&self) {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS duratx_test_rows (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .expect("Failed to create test table");
    }

    /// Count application rows with the given name.
    pub async fn count_rows(&self, name: &str) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM duratx_test_rows WHERE name = $1")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .expect("Failed to count rows");
        count
    }

    /// Get the status column for a workflow, straight from the database.
    pub async fn workflow_status(&self, workflow_uuid: &str) -> Option<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM dbos.workflow_status WHERE workflow_uuid = $1")
                .bind(workflow_uuid)
                .fetch_optional(&self.pool)
                .await
                .ok()?;
        row.map(|r| r.0)
    }

    /// Get the recovery counter for a workflow.
    pub async fn recovery_attempts(&self, workflow_uuid: &str) -> i64 {
        let (attempts,): (i64,) = sqlx::query_as(
            "SELECT recovery_attempts FROM dbos.workflow_status WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid)
        .fetch_one(&self.pool)
        .await
        .expect("Failed to read recovery attempts");
        attempts
    }

    /// Read a recorded non-transaction step output.
    pub async fn operation_output(&self, workflow_uuid: &str, function_id: i32) -> Option<String> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT output FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await
        .expect("Failed to read operation output");
        row.and_then(|r| r.0)
    }

    /// Read a recorded event value.
    pub async fn event_value(&self, workflow_uuid: &str, key: &str) -> Option<String> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2",
        )
        .bind(workflow_uuid)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .expect("Failed to read event value");
        row.map(|r| r.0)
    }

    /// Push buffered terminal writes to the database so status assertions
    /// are deterministic.
    pub async fn flush(&self) {
        self.executor
            .system_db()
            .flush_workflow_status_buffer()
            .await
            .expect("Failed to flush status buffer");
    }

    /// Clean up all state recorded for one workflow, including its app rows.
    pub async fn cleanup_workflow(&self, workflow_uuid: &str) {
        self.executor
            .system_db()
            .purge_workflow(workflow_uuid)
            .await
            .expect("Failed to purge workflow");
        sqlx::query("DELETE FROM dbos.transaction_outputs WHERE workflow_uuid = $1")
            .bind(workflow_uuid)
            .execute(&self.pool)
            .await
            .ok();
    }

    /// Delete application rows with the given name.
    pub async fn cleanup_rows(&self, name: &str) {
        sqlx::query("DELETE FROM duratx_test_rows WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .ok();
    }
}

/// Helper macro to skip tests if DURATX_TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("DURATX_TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: DURATX_TEST_DATABASE_URL not set");
            return;
        }
    };
}
