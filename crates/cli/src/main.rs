// crates/cli/src/main.rs
//! darkhorses: operator entry point for migrations, backfills and verification.

mod args;
mod commands;
mod exit;
mod logging;
mod progress;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use darkhorses_core::Config;

use args::{BackfillCommand, Cli, Command, LedgerCommand};
use commands::Context;
use exit::Outcome;

/// Flags sit on top of file and environment settings.
fn apply_flags(config: &mut Config, cli: &Cli) {
    if let Some(db) = &cli.db {
        config.database.path = Some(db.clone());
    }
    if let Some(plan) = &cli.plan {
        config.plan.path = Some(plan.clone());
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let mut config = Config::load(cli.config.as_deref())?;
    apply_flags(&mut config, &cli);
    let _log_guard = logging::init(cli.verbose, cli.log_json, config.logging.log_dir.as_deref())?;
    tracing::debug!(db = ?config.database.path, plan = ?config.plan.path, "configuration resolved");

    let ctx = Context::open(config).await?;
    match cli.command {
        Command::Migrate { dry_run, output } => commands::migrate(&ctx, dry_run, output).await,
        Command::Status { output } => commands::status(&ctx, output).await,
        Command::History { after, output } => commands::history(&ctx, after, output).await,
        Command::Ledger {
            command: LedgerCommand::Rollback { version },
        } => commands::ledger_rollback(&ctx, version).await,
        Command::Backfill { command } => match command {
            BackfillCommand::Start { job_id, no_run } => {
                commands::backfill_start(&ctx, &job_id, no_run).await
            }
            BackfillCommand::Resume { job_ids } => commands::backfill_resume(&ctx, &job_ids).await,
            BackfillCommand::Pause { job_id } => commands::backfill_pause(&ctx, &job_id).await,
            BackfillCommand::List { output } => commands::backfill_list(&ctx, output).await,
        },
        Command::Verify {
            table,
            threshold,
            output,
        } => commands::verify(&ctx, table.as_deref(), threshold, output).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit with 2 from inside clap
    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(e) = &result {
        let class = exit::classify(e);
        tracing::error!(class = class.as_str(), error = %format!("{e:#}"), "command failed");
        eprintln!("error [{}]: {e:#}", class.as_str());
    }
    exit::exit_code(&result)
}
