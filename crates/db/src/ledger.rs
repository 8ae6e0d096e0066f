// crates/db/src/ledger.rs
//! Migration ledger: the single queryable answer to "which schema versions
//! have been applied".
//!
//! Rows are never deleted. Status changes go through a compare-and-swap on
//! `row_version`, so two processes racing on the same version cannot both win.

use futures_util::{Stream, TryStreamExt};
use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::{now_secs, Database, DbError, DbResult};

const HISTORY_PAGE: i64 = 100;

const SELECT_RECORD: &str = "SELECT version, description, checksum, status, attempted_at, \
     applied_at, error_detail, row_version, updated_at FROM _schema_ledger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "applied" => Some(Self::Applied),
            "failed" => Some(Self::Failed),
            "rolled_back" => Some(Self::RolledBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One applied (or attempted) schema change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub checksum: String,
    pub status: MigrationStatus,
    pub attempted_at: i64,
    pub applied_at: Option<i64>,
    pub error_detail: Option<String>,
    pub row_version: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for MigrationRecord {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Self {
            version: row.try_get("version")?,
            description: row.try_get("description")?,
            checksum: row.try_get("checksum")?,
            status: MigrationStatus::parse(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown ledger status {status:?}").into()))?,
            attempted_at: row.try_get("attempted_at")?,
            applied_at: row.try_get("applied_at")?,
            error_detail: row.try_get("error_detail")?,
            row_version: row.try_get("row_version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl Database {
    /// Look up one ledger row.
    pub async fn get_migration(&self, version: i64) -> DbResult<Option<MigrationRecord>> {
        let record = sqlx::query_as::<_, MigrationRecord>(&format!("{SELECT_RECORD} WHERE version = ?1"))
            .bind(version)
            .fetch_optional(self.pool())
            .await?;
        Ok(record)
    }

    /// Highest version with `status = applied` (0 once the ledger exists).
    pub async fn latest_applied_version(&self) -> DbResult<Option<i64>> {
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM _schema_ledger WHERE status = 'applied'")
                .fetch_one(self.pool())
                .await?;
        Ok(latest)
    }

    /// Register an attempt to apply `version`.
    ///
    /// - already `applied` with the same checksum: returns the applied record
    ///   unchanged (caller treats it as a no-op)
    /// - already `applied` with a different checksum: `DuplicateVersion`
    /// - `pending` / `failed` / `rolled_back`: reset to `pending` for a retry
    /// - unknown: inserted as `pending`, provided no later version is applied
    pub async fn record_attempt(
        &self,
        version: i64,
        description: &str,
        checksum: &str,
    ) -> DbResult<MigrationRecord> {
        let existing = self.get_migration(version).await?;
        if let Some(rec) = &existing {
            if rec.status == MigrationStatus::Applied {
                if rec.checksum != checksum {
                    warn!(version, recorded = %rec.checksum, checksum, "schema drift detected");
                    return Err(DbError::DuplicateVersion {
                        version,
                        recorded: rec.checksum.clone(),
                        checksum: checksum.to_string(),
                    });
                }
                return Ok(rec.clone());
            }
        }

        if let Some(latest) = self.latest_applied_version().await? {
            if version < latest {
                return Err(DbError::OutOfOrderVersion { version, latest });
            }
        }

        let now = now_secs();
        match existing {
            Some(rec) => {
                let result = sqlx::query(
                    r#"UPDATE _schema_ledger
                       SET status = 'pending', description = ?1, checksum = ?2,
                           attempted_at = ?3, error_detail = NULL,
                           row_version = row_version + 1, updated_at = ?3
                       WHERE version = ?4 AND row_version = ?5"#,
                )
                .bind(description)
                .bind(checksum)
                .bind(now)
                .bind(version)
                .bind(rec.row_version)
                .execute(self.pool())
                .await?;
                if result.rows_affected() == 0 {
                    return Err(stale(version));
                }
                info!(version, previous = %rec.status, "retrying migration");
            }
            None => {
                let result = sqlx::query(
                    r#"INSERT INTO _schema_ledger
                         (version, description, checksum, status, attempted_at, updated_at)
                       VALUES (?1, ?2, ?3, 'pending', ?4, ?4)
                       ON CONFLICT(version) DO NOTHING"#,
                )
                .bind(version)
                .bind(description)
                .bind(checksum)
                .bind(now)
                .execute(self.pool())
                .await?;
                if result.rows_affected() == 0 {
                    return Err(stale(version));
                }
            }
        }

        self.get_migration(version)
            .await?
            .ok_or(DbError::MigrationNotFound(version))
    }

    /// `pending -> applied`. Calling it on an applied version is a no-op.
    pub async fn mark_applied(&self, version: i64) -> DbResult<MigrationRecord> {
        let rec = self.require_migration(version).await?;
        match rec.status {
            MigrationStatus::Applied => Ok(rec),
            MigrationStatus::Pending => {
                self.transition(&rec, MigrationStatus::Applied, None).await
            }
            other => Err(illegal(version, other, MigrationStatus::Applied)),
        }
    }

    /// `pending -> failed`. Calling it on a failed version is a no-op.
    pub async fn mark_failed(&self, version: i64, error_detail: &str) -> DbResult<MigrationRecord> {
        let rec = self.require_migration(version).await?;
        match rec.status {
            MigrationStatus::Failed => Ok(rec),
            MigrationStatus::Pending => {
                self.transition(&rec, MigrationStatus::Failed, Some(error_detail))
                    .await
            }
            other => Err(illegal(version, other, MigrationStatus::Failed)),
        }
    }

    /// Record that an operator reverted `version` by hand, which makes it
    /// eligible for re-application. Only `applied` and `failed` rows qualify.
    pub async fn mark_rolled_back(&self, version: i64) -> DbResult<MigrationRecord> {
        if version == 0 {
            return Err(DbError::ManualInterventionRequired(
                "the ledger bootstrap (version 0) cannot be rolled back".into(),
            ));
        }
        let rec = self.require_migration(version).await?;
        match rec.status {
            MigrationStatus::RolledBack => Ok(rec),
            MigrationStatus::Applied | MigrationStatus::Failed => {
                let detail = rec.error_detail.clone();
                self.transition(&rec, MigrationStatus::RolledBack, detail.as_deref())
                    .await
            }
            other => Err(illegal(version, other, MigrationStatus::RolledBack)),
        }
    }

    /// Ledger rows ordered by version, fetched lazily a page at a time.
    pub fn history(&self) -> impl Stream<Item = DbResult<MigrationRecord>> + Send + 'static {
        self.history_from(None)
    }

    /// Like `history`, restarting after `after` (exclusive).
    pub fn history_from(
        &self,
        after: Option<i64>,
    ) -> impl Stream<Item = DbResult<MigrationRecord>> + Send + 'static {
        let pool = self.pool().clone();
        async_stream::try_stream! {
            let mut cursor = after.unwrap_or(i64::MIN);
            loop {
                let page: Vec<MigrationRecord> = sqlx::query_as(&format!(
                    "{SELECT_RECORD} WHERE version > ?1 ORDER BY version ASC LIMIT ?2"
                ))
                .bind(cursor)
                .bind(HISTORY_PAGE)
                .fetch_all(&pool)
                .await
                .map_err(DbError::from)?;

                let last_page = (page.len() as i64) < HISTORY_PAGE;
                for record in page {
                    cursor = record.version;
                    yield record;
                }
                if last_page {
                    break;
                }
            }
        }
    }

    /// Whole ledger, collected.
    pub async fn ledger_entries(&self) -> DbResult<Vec<MigrationRecord>> {
        self.history().try_collect().await
    }

    async fn require_migration(&self, version: i64) -> DbResult<MigrationRecord> {
        self.get_migration(version)
            .await?
            .ok_or(DbError::MigrationNotFound(version))
    }

    async fn transition(
        &self,
        rec: &MigrationRecord,
        to: MigrationStatus,
        error_detail: Option<&str>,
    ) -> DbResult<MigrationRecord> {
        let now = now_secs();
        let applied_at = match to {
            MigrationStatus::Applied => Some(now),
            _ => rec.applied_at,
        };
        let result = sqlx::query(
            r#"UPDATE _schema_ledger
               SET status = ?1, applied_at = ?2, error_detail = ?3,
                   row_version = row_version + 1, updated_at = ?4
               WHERE version = ?5 AND row_version = ?6"#,
        )
        .bind(to.as_str())
        .bind(applied_at)
        .bind(error_detail)
        .bind(now)
        .bind(rec.version)
        .bind(rec.row_version)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(stale(rec.version));
        }
        info!(version = rec.version, from = %rec.status, to = %to, "ledger status changed");
        self.require_migration(rec.version).await
    }
}

fn stale(version: i64) -> DbError {
    DbError::StaleWrite {
        entity: "migration",
        key: version.to_string(),
    }
}

fn illegal(version: i64, from: MigrationStatus, to: MigrationStatus) -> DbError {
    DbError::InvalidTransition {
        entity: "migration",
        key: version.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
