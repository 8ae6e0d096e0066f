// crates/db/src/lib.rs
//! SQLite-backed schema migration and backfill reconciliation engine.
//!
//! - `ledger`: durable record of applied schema versions
//! - `executor`: idempotent schema steps with catalog-verified post-conditions
//! - `backfill`: checkpointed, resumable population jobs
//! - `verifier`: read-only coverage / integrity / uniqueness reports

pub mod backfill;
pub mod catalog;
pub mod executor;
pub mod ledger;
mod migrations;
pub mod verifier;

pub use backfill::{
    BackfillJob, BackfillRunner, BatchResult, CursorKey, ExpressionTransform, RowTransform,
    UpstreamTransform,
};
pub use executor::{MigrationExecutor, MigrationSummary, StepAction, StepOutcome};
pub use ledger::{MigrationRecord, MigrationStatus};
pub use verifier::{ColumnCoverage, CoverageStatus, Finding, ReconciliationReport, Verifier};

use darkhorses_core::upstream::UpstreamError;
use darkhorses_core::ErrorClass;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("Failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),

    #[error("Schema conflict on {object}: {detail}")]
    SchemaConflict { object: String, detail: String },

    #[error("Refusing to drop {object}: {count} row(s) still hold data")]
    UnsafeDrop { object: String, count: i64 },

    #[error("Manual intervention required: {0}")]
    ManualInterventionRequired(String),

    #[error("Migration {version} was applied with checksum {recorded} but the plan now has {checksum}")]
    DuplicateVersion {
        version: i64,
        recorded: String,
        checksum: String,
    },

    #[error("Migration {version} is not applied but {latest} already is; versions must be applied in order")]
    OutOfOrderVersion { version: i64, latest: i64 },

    #[error("Migration {0} not found in ledger")]
    MigrationNotFound(i64),

    #[error("Illegal status change for {entity} {key}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        key: String,
        from: String,
        to: String,
    },

    #[error("Stale write to {entity} {key}: row was modified concurrently")]
    StaleWrite { entity: &'static str, key: String },

    #[error("Backfill lock {lock_key} is held by job {holder}")]
    LockHeld { lock_key: String, holder: String },

    #[error("Backfill job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid backfill job {job_id}: {detail}")]
    InvalidJob { job_id: String, detail: String },

    #[error("Backfill {job_id} still rate limited after {attempts} attempts")]
    RateLimited { job_id: String, attempts: u32 },

    #[error("Backfill {job_id} batch (size {batch_size}) timed out {attempts} times")]
    TimeoutDuringBatch {
        job_id: String,
        batch_size: u32,
        attempts: u32,
    },

    #[error("{0} does not exist")]
    MissingObject(String),

    #[error("{what} did not finish within {timeout_ms}ms")]
    StatementTimeout { what: String, timeout_ms: u64 },

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
}

impl DbError {
    /// Operator-facing classification, used for exit codes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SchemaConflict { .. }
            | Self::UnsafeDrop { .. }
            | Self::ManualInterventionRequired(_)
            | Self::DuplicateVersion { .. }
            | Self::OutOfOrderVersion { .. } => ErrorClass::ManualIntervention,
            Self::StaleWrite { .. }
            | Self::LockHeld { .. }
            | Self::RateLimited { .. }
            | Self::TimeoutDuringBatch { .. }
            | Self::StatementTimeout { .. } => ErrorClass::Transient,
            Self::Upstream(e) if e.is_transient() => ErrorClass::Transient,
            Self::Sqlx(sqlx::Error::PoolTimedOut) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Main database handle wrapping a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl Database {
    /// Open (or create) the database at the given path and bootstrap the ledger.
    pub async fn new(path: &Path) -> DbResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            db_path: path.to_owned(),
        };
        db.bootstrap().await?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    ///
    /// Uses `shared_cache(true)` so all pool connections share the same
    /// in-memory database. Without this, each connection gets its own
    /// separate database.
    pub async fn new_in_memory() -> DbResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .shared_cache(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            db_path: PathBuf::new(),
        };
        db.bootstrap().await?;
        Ok(db)
    }

    /// Open the database at the default location: `~/.cache/darkhorses/darkhorses.db`
    pub async fn open_default() -> DbResult<Self> {
        let path = default_db_path()?;
        Self::new(&path).await
    }

    /// Ledger version 0: create the bookkeeping tables.
    ///
    /// Runs in one transaction and is a no-op when the tables already exist.
    pub async fn bootstrap(&self) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::raw_sql(migrations::BOOTSTRAP).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the path to the database file.
    /// Returns an empty path for in-memory databases.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// Returns the default database path: `~/.cache/darkhorses/darkhorses.db`
pub fn default_db_path() -> DbResult<PathBuf> {
    darkhorses_core::paths::db_path().ok_or(DbError::NoCacheDir)
}

/// Quote an identifier for interpolation into SQL.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_database() {
        let db = Database::new_in_memory()
            .await
            .expect("should create in-memory database");

        for table in ["_schema_ledger", "_backfill_jobs", "_backfill_locks"] {
            let count: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(db.pool())
                .await
                .unwrap_or_else(|e| panic!("{table} should exist: {e}"));
            assert!(count.0 <= 1);
        }
    }

    #[tokio::test]
    async fn test_bootstrap_idempotent() {
        let db = Database::new_in_memory()
            .await
            .expect("first open should succeed");

        db.bootstrap()
            .await
            .expect("second bootstrap should be a no-op");

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM _schema_ledger WHERE version = 0")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1, "version 0 is recorded exactly once");
    }

    #[tokio::test]
    async fn test_file_based_database() {
        let tmp = tempfile::tempdir().expect("should create temp dir");
        let db_path = tmp.path().join("nested").join("racing.db");

        let db = Database::new(&db_path)
            .await
            .expect("should create file-based database");
        assert_eq!(db.db_path(), db_path.as_path());
        assert!(db_path.exists(), "database file should be created on disk");

        // Reopening runs bootstrap again without error
        drop(db);
        Database::new(&db_path).await.expect("reopen");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("horses"), "\"horses\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_error_classes() {
        let e = DbError::UnsafeDrop {
            object: "legacy_results".into(),
            count: 5,
        };
        assert_eq!(e.class(), ErrorClass::ManualIntervention);
        let e = DbError::RateLimited {
            job_id: "x".into(),
            attempts: 3,
        };
        assert_eq!(e.class(), ErrorClass::Transient);
        assert_eq!(DbError::JobNotFound("x".into()).class(), ErrorClass::Fatal);
        let e = DbError::Upstream(UpstreamError::RateLimited { retry_after: None });
        assert_eq!(e.class(), ErrorClass::Transient);
    }
}
