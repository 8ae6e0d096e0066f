// crates/db/src/backfill/store.rs
//! Persistence for `_backfill_jobs`, one row per job.

use darkhorses_jobs::JobStatus;
use serde::Serialize;
use sqlx::{Row, SqliteConnection};

use super::cursor::CursorKey;
use crate::{now_secs, Database, DbError, DbResult};

const SELECT_JOB: &str = "SELECT job_id, target_table, target_columns, key_column, predicate, \
     batch_size, checkpoint_kind, checkpoint_cursor, checkpoint_rowid, rows_examined_total, \
     rows_updated_total, rows_skipped_total, initial_pending, status, error_detail, started_at, \
     completed_at, row_version, updated_at FROM _backfill_jobs";

/// Durable state of one backfill: what it targets, how far it got, and
/// where it stands in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillJob {
    pub job_id: String,
    pub target_table: String,
    pub target_columns: Vec<String>,
    pub key_column: String,
    pub predicate: String,
    pub batch_size: u32,
    /// Key of the last row covered by a committed batch; `None` before the first.
    pub checkpoint_cursor: Option<CursorKey>,
    /// `rowid` of that row; breaks ties between rows sharing a key value.
    pub checkpoint_rowid: Option<i64>,
    pub rows_examined_total: i64,
    pub rows_updated_total: i64,
    pub rows_skipped_total: i64,
    /// Predicate matches counted at `start`, for progress display.
    pub initial_pending: i64,
    pub status: JobStatus,
    pub error_detail: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub row_version: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for BackfillJob {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        let columns_json: String = row.try_get("target_columns")?;
        let target_columns: Vec<String> = serde_json::from_str(&columns_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        let kind: Option<String> = row.try_get("checkpoint_kind")?;
        let raw: Option<String> = row.try_get("checkpoint_cursor")?;
        let checkpoint_cursor = match (kind, raw) {
            (Some(kind), Some(raw)) => Some(CursorKey::decode(&kind, &raw).ok_or_else(|| {
                sqlx::Error::Decode(format!("bad checkpoint {kind}:{raw}").into())
            })?),
            _ => None,
        };

        let status: String = row.try_get("status")?;
        let batch_size: i64 = row.try_get("batch_size")?;

        Ok(Self {
            job_id: row.try_get("job_id")?,
            target_table: row.try_get("target_table")?,
            target_columns,
            key_column: row.try_get("key_column")?,
            predicate: row.try_get("predicate")?,
            batch_size: u32::try_from(batch_size)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            checkpoint_cursor,
            checkpoint_rowid: row.try_get("checkpoint_rowid")?,
            rows_examined_total: row.try_get("rows_examined_total")?,
            rows_updated_total: row.try_get("rows_updated_total")?,
            rows_skipped_total: row.try_get("rows_skipped_total")?,
            initial_pending: row.try_get("initial_pending")?,
            status: JobStatus::parse(&status)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown job status {status:?}").into()))?,
            error_detail: row.try_get("error_detail")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            row_version: row.try_get("row_version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Legal lifecycle moves. `Running -> Running` is a takeover after the
/// previous holder's lease expired.
pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Created, Running)
            | (Created, Paused)
            | (Running, Running)
            | (Running, Completed)
            | (Running, Paused)
            | (Running, Failed)
            | (Paused, Running)
            | (Failed, Running)
    )
}

impl Database {
    pub async fn get_backfill_job(&self, job_id: &str) -> DbResult<Option<BackfillJob>> {
        let job = sqlx::query_as::<_, BackfillJob>(&format!("{SELECT_JOB} WHERE job_id = ?1"))
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(job)
    }

    pub async fn list_backfill_jobs(&self) -> DbResult<Vec<BackfillJob>> {
        let jobs = sqlx::query_as::<_, BackfillJob>(&format!("{SELECT_JOB} ORDER BY started_at, job_id"))
            .fetch_all(self.pool())
            .await?;
        Ok(jobs)
    }

    /// Insert a new job row. Fails with `StaleWrite` if the id is taken.
    pub(crate) async fn insert_backfill_job(&self, job: &BackfillJob) -> DbResult<()> {
        let columns = serde_json::to_string(&job.target_columns).map_err(|e| DbError::InvalidJob {
            job_id: job.job_id.clone(),
            detail: e.to_string(),
        })?;
        let result = sqlx::query(
            r#"INSERT INTO _backfill_jobs
                 (job_id, target_table, target_columns, key_column, predicate, batch_size,
                  initial_pending, status, started_at, row_version, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?9)
               ON CONFLICT(job_id) DO NOTHING"#,
        )
        .bind(&job.job_id)
        .bind(&job.target_table)
        .bind(columns)
        .bind(&job.key_column)
        .bind(&job.predicate)
        .bind(i64::from(job.batch_size))
        .bind(job.initial_pending)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.row_version)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(stale(&job.job_id));
        }
        Ok(())
    }

    /// Compare-and-swap the whole mutable part of `job`, then bump its
    /// in-memory `row_version` to match.
    pub async fn save_backfill_job(&self, job: &mut BackfillJob) -> DbResult<()> {
        let mut next = job.clone();
        next.updated_at = now_secs();
        let mut conn = self.pool().acquire().await?;
        write_job(&mut conn, &next).await?;
        next.row_version += 1;
        *job = next;
        Ok(())
    }
}

/// CAS update of `job` guarded by `job.row_version`.
///
/// Runs on any connection so the batch loop can commit the checkpoint in the
/// same transaction as the data. `updated_at` is written as given; the
/// caller bumps `row_version` after commit.
pub(crate) async fn write_job(conn: &mut SqliteConnection, job: &BackfillJob) -> DbResult<()> {
    let result = sqlx::query(
        r#"UPDATE _backfill_jobs
           SET batch_size = ?1, checkpoint_kind = ?2, checkpoint_cursor = ?3,
               checkpoint_rowid = ?4,
               rows_examined_total = ?5, rows_updated_total = ?6, rows_skipped_total = ?7,
               status = ?8, error_detail = ?9, completed_at = ?10,
               row_version = row_version + 1, updated_at = ?11
           WHERE job_id = ?12 AND row_version = ?13"#,
    )
    .bind(i64::from(job.batch_size))
    .bind(job.checkpoint_cursor.as_ref().map(CursorKey::kind))
    .bind(job.checkpoint_cursor.as_ref().map(CursorKey::encode))
    .bind(job.checkpoint_rowid)
    .bind(job.rows_examined_total)
    .bind(job.rows_updated_total)
    .bind(job.rows_skipped_total)
    .bind(job.status.as_str())
    .bind(job.error_detail.as_deref())
    .bind(job.completed_at)
    .bind(job.updated_at)
    .bind(&job.job_id)
    .bind(job.row_version)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(stale(&job.job_id));
    }
    Ok(())
}

fn stale(job_id: &str) -> DbError {
    DbError::StaleWrite {
        entity: "backfill job",
        key: job_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(job_id: &str) -> BackfillJob {
        BackfillJob {
            job_id: job_id.into(),
            target_table: "horses".into(),
            target_columns: vec!["sire_id".into(), "dam_id".into()],
            key_column: "id".into(),
            predicate: "sire_id IS NULL".into(),
            batch_size: 50,
            checkpoint_cursor: None,
            checkpoint_rowid: None,
            rows_examined_total: 0,
            rows_updated_total: 0,
            rows_skipped_total: 0,
            initial_pending: 120,
            status: JobStatus::Created,
            error_detail: None,
            started_at: now_secs(),
            completed_at: None,
            row_version: 1,
            updated_at: now_secs(),
        }
    }

    #[test]
    fn test_transitions() {
        assert!(can_transition(JobStatus::Created, JobStatus::Running));
        assert!(can_transition(JobStatus::Failed, JobStatus::Running));
        assert!(!can_transition(JobStatus::Completed, JobStatus::Running));
        assert!(!can_transition(JobStatus::Created, JobStatus::Completed));
        assert!(!can_transition(JobStatus::Paused, JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_insert_get_save() {
        let db = Database::new_in_memory().await.unwrap();
        let mut job = sample("horses-pedigree");
        db.insert_backfill_job(&job).await.unwrap();

        let loaded = db.get_backfill_job("horses-pedigree").await.unwrap().unwrap();
        assert_eq!(loaded.target_columns, job.target_columns);
        assert_eq!(loaded.status, JobStatus::Created);
        assert_eq!(loaded.checkpoint_cursor, None);

        job.checkpoint_cursor = Some(CursorKey::Int(300));
        job.rows_examined_total = 300;
        db.save_backfill_job(&mut job).await.unwrap();
        assert_eq!(job.row_version, 2);

        let loaded = db.get_backfill_job("horses-pedigree").await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_cursor, Some(CursorKey::Int(300)));
        assert_eq!(loaded.row_version, 2);
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let db = Database::new_in_memory().await.unwrap();
        let job = sample("j");
        db.insert_backfill_job(&job).await.unwrap();

        let mut first = job.clone();
        let mut second = job.clone();
        db.save_backfill_job(&mut first).await.unwrap();
        let err = db.save_backfill_job(&mut second).await.unwrap_err();
        assert!(matches!(err, DbError::StaleWrite { .. }));
        assert_eq!(second.row_version, 1, "failed CAS leaves the copy untouched");
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_stale() {
        let db = Database::new_in_memory().await.unwrap();
        let job = sample("j");
        db.insert_backfill_job(&job).await.unwrap();
        assert!(matches!(
            db.insert_backfill_job(&job).await.unwrap_err(),
            DbError::StaleWrite { .. }
        ));
    }
}
