// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for duratx-core.
//!
//! The system-database schema is embedded as sqlx migrations and applied
//! programmatically at executor init. The user database receives a single
//! engine-owned table (`dbos.transaction_outputs`) so transaction-step
//! outputs can commit atomically with the application's own writes; it is
//! provisioned with plain idempotent DDL rather than a second migrator, so
//! the application's own migration history is never touched.

use sqlx::migrate::MigrateError;
use sqlx::PgPool;

/// System-database migrator with all engine migrations embedded.
pub static SYSTEM: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Run system-database migrations.
///
/// Applies all pending migrations. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_system(pool: &PgPool) -> Result<(), MigrateError> {
    SYSTEM.run(pool).await
}

/// Provision the engine's table in the user database.
///
/// Transaction steps insert their output row inside the same transaction as
/// the user's effects, which is only possible when the table lives in the
/// user database itself.
pub async fn ensure_user_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(
        r#"
        CREATE SCHEMA IF NOT EXISTS dbos;
        CREATE TABLE IF NOT EXISTS dbos.transaction_outputs (
            workflow_uuid TEXT NOT NULL,
            function_id INT NOT NULL,
            output TEXT,
            error TEXT,
            txn_snapshot TEXT,
            txn_id TEXT,
            created_at BIGINT NOT NULL DEFAULT (EXTRACT(EPOCH FROM now()) * 1000)::bigint,
            PRIMARY KEY (workflow_uuid, function_id)
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
