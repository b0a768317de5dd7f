// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duratx Control CLI
//!
//! Admin tool for inspecting and managing workflow state in the system
//! database.
//!
//! Usage:
//!   duratx-ctl <command> [options]
//!
//! Commands:
//!   migrate                       Bring the system schema up to date
//!   list [--status <s>] [--name <n>] [--user <u>] [--limit <n>]
//!   status <workflow_uuid>        Show one workflow's status row
//!   cancel <workflow_uuid>        Cancel a non-terminal workflow
//!   recover [executor_id ...]     Resume pending workflows
//!   purge <workflow_uuid>         Delete all recorded state of a workflow

use std::process::ExitCode;

use sqlx::postgres::PgPoolOptions;

use duratx_core::{Config, Executor, ListWorkflowsFilter, Registry, SystemDatabase, WorkflowStatus};

fn print_usage() {
    eprintln!(
        r#"Usage: duratx-ctl <command> [options]

Inspect and manage durable workflow state.

COMMANDS:
    migrate                         Bring the system schema up to date
    list                            List workflow UUIDs
    status <workflow_uuid>          Show one workflow's status row
    cancel <workflow_uuid>          Cancel a non-terminal workflow
    recover [executor_id ...]       Resume pending workflows owned by the
                                    given executors (default: this one)
    purge <workflow_uuid>           Delete all recorded state of a workflow

LIST OPTIONS:
    --status <s>                    PENDING | SUCCESS | ERROR | CANCELLED | RETRIES_EXCEEDED
    --name <n>                      Operation name
    --user <u>                      Authenticated user
    --limit <n>                     Maximum rows (default 100)

Connection settings come from the environment (DURATX_DB_HOST,
DURATX_APP_DB_NAME, DURATX_DB_PORT, DURATX_DB_USER, PGPASSWORD, ...)."#
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duratx_core=warn".parse().expect("valid directive")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return ExitCode::FAILURE;
    };

    match run(command, &args[1..]).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: &str, args: &[String]) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect_with(config.system_connect_options())
        .await?;

    match command {
        "migrate" => {
            duratx_core::migrations::run_system(&pool).await?;
            println!("system schema is up to date");
        }
        "list" => {
            let sysdb = SystemDatabase::new(pool);
            let filter = parse_list_filter(args)?;
            for uuid in sysdb.get_workflows(&filter).await? {
                println!("{}", uuid);
            }
        }
        "status" => {
            let uuid = required_arg(args, "workflow_uuid")?;
            let sysdb = SystemDatabase::new(pool);
            match sysdb.get_workflow_status(uuid).await? {
                Some(record) => {
                    println!("workflow_uuid:       {}", record.workflow_uuid);
                    println!("status:              {}", record.status);
                    println!("name:                {}", record.name);
                    println!(
                        "authenticated_user:  {}",
                        record.authenticated_user.as_deref().unwrap_or("-")
                    );
                    println!(
                        "executor_id:         {}",
                        record.executor_id.as_deref().unwrap_or("-")
                    );
                    println!("recovery_attempts:   {}", record.recovery_attempts);
                    println!("created_at:          {}", record.created_at);
                    println!("updated_at:          {}", record.updated_at);
                    if let Some(error) = &record.error {
                        println!("error:               {}", error);
                    }
                }
                None => anyhow::bail!("workflow '{}' not found", uuid),
            }
        }
        "cancel" => {
            let uuid = required_arg(args, "workflow_uuid")?;
            let sysdb = SystemDatabase::new(pool);
            sysdb.cancel_workflow(uuid).await?;
            println!("cancelled {}", uuid);
        }
        "recover" => {
            // Only operations registered in this process can re-run; an
            // embedding application's admin binary links its own registry.
            let executor = Executor::builder()
                .config(config)
                .registry(Registry::default())
                .system_pool(pool)
                .start()
                .await?;
            let executor_ids = if args.is_empty() {
                None
            } else {
                Some(args.to_vec())
            };
            let handles = executor.recover_pending_workflows(executor_ids).await?;
            for handle in &handles {
                println!("{}", handle.workflow_uuid());
            }
            println!("resumed {} workflow(s)", handles.len());
            executor.destroy().await?;
        }
        "purge" => {
            let uuid = required_arg(args, "workflow_uuid")?;
            let sysdb = SystemDatabase::new(pool);
            sysdb.purge_workflow(uuid).await?;
            println!("purged {}", uuid);
        }
        other => {
            print_usage();
            anyhow::bail!("unknown command '{}'", other);
        }
    }
    Ok(())
}

fn required_arg<'a>(args: &'a [String], name: &str) -> anyhow::Result<&'a str> {
    args.first()
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing required argument <{}>", name))
}

fn parse_list_filter(args: &[String]) -> anyhow::Result<ListWorkflowsFilter> {
    let mut filter = ListWorkflowsFilter::default();
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let value = iter
            .next()
            .ok_or_else(|| anyhow::anyhow!("missing value for {}", flag))?;
        match flag.as_str() {
            "--status" => {
                filter.status = Some(
                    WorkflowStatus::parse(value)
                        .ok_or_else(|| anyhow::anyhow!("unknown status '{}'", value))?,
                );
            }
            "--name" => filter.name = Some(value.clone()),
            "--user" => filter.authenticated_user = Some(value.clone()),
            "--limit" => filter.limit = Some(value.parse()?),
            other => anyhow::bail!("unknown option '{}'", other),
        }
    }
    Ok(filter)
}
