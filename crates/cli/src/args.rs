// crates/cli/src/args.rs
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Schema migrations and backfill reconciliation for the racing warehouse.
#[derive(Debug, Parser)]
#[command(name = "darkhorses", version)]
pub struct Cli {
    /// Config file (defaults to <config dir>/darkhorses/config.toml when present)
    #[arg(long, global = true, value_name = "FILE", env = "DARKHORSES_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database to operate on
    #[arg(long, global = true, value_name = "FILE")]
    pub db: Option<PathBuf>,

    /// Plan file declaring migrations, backfills and verifications
    #[arg(long, global = true, value_name = "FILE")]
    pub plan: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending migrations from the plan
    Migrate {
        /// List what would run without touching the schema
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        output: Output,
    },
    /// Ledger position, pending migrations and backfill jobs
    Status {
        #[command(flatten)]
        output: Output,
    },
    /// Every ledger entry in version order
    History {
        /// Only entries after this version
        #[arg(long, value_name = "VERSION")]
        after: Option<i64>,
        #[command(flatten)]
        output: Output,
    },
    /// Operator corrections to the ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Resumable data population jobs
    Backfill {
        #[command(subcommand)]
        command: BackfillCommand,
    },
    /// Coverage, orphan and duplicate checks
    Verify {
        /// Check only this table's verification entry
        #[arg(long)]
        table: Option<String>,
        /// Override every entry's coverage threshold (percent)
        #[arg(long)]
        threshold: Option<f64>,
        #[command(flatten)]
        output: Output,
    },
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    /// Record that an applied or failed migration was reverted by hand
    Rollback { version: i64 },
}

#[derive(Debug, Subcommand)]
pub enum BackfillCommand {
    /// Register a job from the plan and run it
    Start {
        job_id: String,
        /// Register only; run later with `backfill resume`
        #[arg(long)]
        no_run: bool,
    },
    /// Continue one or more jobs from their checkpoints
    Resume {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },
    /// Ask a running job to stop at its next batch
    Pause { job_id: String },
    /// Persisted jobs and their progress
    List {
        #[command(flatten)]
        output: Output,
    },
}

#[derive(Debug, Clone, Copy, Default, Args)]
pub struct Output {
    /// Print machine-readable JSON on stdout
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "darkhorses",
            "migrate",
            "--dry-run",
            "--db",
            "/tmp/w.db",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/w.db")));
        assert!(matches!(cli.command, Command::Migrate { dry_run: true, .. }));
    }

    #[test]
    fn test_backfill_resume_takes_several_jobs() {
        let cli =
            Cli::try_parse_from(["darkhorses", "backfill", "resume", "colours", "pedigree"]).unwrap();
        match cli.command {
            Command::Backfill {
                command: BackfillCommand::Resume { job_ids },
            } => assert_eq!(job_ids, vec!["colours", "pedigree"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_resume_without_job_is_usage_error() {
        let err = Cli::try_parse_from(["darkhorses", "backfill", "resume"]).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_ledger_rollback_version() {
        let cli = Cli::try_parse_from(["darkhorses", "ledger", "rollback", "18"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Ledger {
                command: LedgerCommand::Rollback { version: 18 }
            }
        ));
    }
}
