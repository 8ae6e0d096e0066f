// crates/db/src/backfill/runner.rs
//! The batch loop.
//!
//! One batch = SELECT up to `batch_size` rows past the `(key, rowid)` cursor,
//! transform them outside any transaction, then write the row updates and the advanced
//! checkpoint in a single transaction. The checkpoint therefore never covers
//! rows whose update did not commit, and a row is only ever re-processed
//! (idempotently) when a batch is retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use darkhorses_core::upstream::UpstreamError;
use darkhorses_core::{Backoff, BackfillDef, RunnerConfig, TransformDef};
use darkhorses_jobs::{JobHandle, JobRegistry, JobState, JobStatus};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, TypeInfo, ValueRef};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cursor::CursorKey;
use super::lease::{lock_keys, Lease};
use super::store::{can_transition, write_job, BackfillJob};
use super::transform::{RowPatch, RowTransform, SourceRow, TransformError};
use crate::{catalog, now_secs, quote_ident, Database, DbError, DbResult};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const KEY_TEXT: &str = "__dh_key";
const KEY_TYPE: &str = "__dh_key_type";
const ROWID: &str = "__dh_rowid";

/// Outcome of one committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub rows_examined: u64,
    pub rows_updated: u64,
    /// Rows the transform could not populate.
    pub rows_skipped: u64,
    /// `None` when the batch was empty and the cursor stayed put.
    pub cursor_advanced_to: Option<CursorKey>,
}

/// Why a batch attempt did not commit.
enum BatchFailure {
    RateLimited(Option<Duration>),
    UpstreamTimeout(Duration),
    Error(DbError),
}

impl From<DbError> for BatchFailure {
    fn from(e: DbError) -> Self {
        Self::Error(e)
    }
}

impl From<sqlx::Error> for BatchFailure {
    fn from(e: sqlx::Error) -> Self {
        Self::Error(e.into())
    }
}

/// Transform results of the batch being retried, keyed by `rowid`.
type BatchMemo = HashMap<i64, Option<RowPatch>>;

pub struct BackfillRunner {
    db: Database,
    config: RunnerConfig,
}

/// A job running on its own task; `wait` yields the final persisted job.
pub struct SpawnedBackfill {
    pub handle: JobHandle,
    result: oneshot::Receiver<DbResult<BackfillJob>>,
}

impl SpawnedBackfill {
    pub async fn wait(self) -> DbResult<BackfillJob> {
        let id = self.handle.id;
        self.handle.join().await;
        self.result.await.unwrap_or_else(|_| {
            Err(DbError::InvalidJob {
                job_id: id.to_string(),
                detail: "runner task ended without a result".into(),
            })
        })
    }
}

impl BackfillRunner {
    pub fn new(db: Database, config: RunnerConfig) -> Self {
        Self { db, config }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register the job described by `def`.
    ///
    /// Validates the target table, columns and predicate, counts the rows the
    /// predicate matches, and persists the job in `created` before any data
    /// is touched. Starting an existing job id returns the stored job.
    pub async fn start(&self, def: &BackfillDef) -> DbResult<BackfillJob> {
        let invalid = |detail: String| DbError::InvalidJob {
            job_id: def.job_id.clone(),
            detail,
        };
        def.validate().map_err(|e| invalid(e.to_string()))?;

        if let Some(existing) = self.db.get_backfill_job(&def.job_id).await? {
            let same_target = existing.target_table.eq_ignore_ascii_case(&def.table)
                && lock_keys(&existing.target_table, &existing.target_columns)
                    == lock_keys(&def.table, &def.columns);
            if !same_target {
                return Err(invalid(format!(
                    "already registered for {}({})",
                    existing.target_table,
                    existing.target_columns.join(", ")
                )));
            }
            debug!(job_id = %def.job_id, status = %existing.status, "job already registered");
            return Ok(existing);
        }

        let mut conn = self.db.pool().acquire().await?;
        if !catalog::table_exists(&mut conn, &def.table).await? {
            return Err(invalid(format!("table {} does not exist", def.table)));
        }
        let cols = catalog::columns(&mut conn, &def.table).await?;
        for c in def.columns.iter().chain(std::iter::once(&def.key_column)) {
            if !cols.iter().any(|col| col.name.eq_ignore_ascii_case(c)) {
                return Err(invalid(format!("column {}.{c} does not exist", def.table)));
            }
        }

        // Batches address rows by rowid
        let rowid_check = format!("SELECT rowid FROM {} LIMIT 0", quote_ident(&def.table));
        sqlx::query(&rowid_check)
            .fetch_all(&mut *conn)
            .await
            .map_err(|_| invalid(format!("table {} has no rowid", def.table)))?;

        // Expressions are prepared here so a typo fails before the job exists
        if let TransformDef::Expression { assignments } = &def.transform {
            for expr in assignments.values() {
                let check = format!("SELECT ({expr}) FROM {} LIMIT 0", quote_ident(&def.table));
                sqlx::query(&check)
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(|e| invalid(format!("expression {expr:?}: {e}")))?;
            }
        }

        let key = quote_ident(&def.key_column);
        let count_sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {key} IS NOT NULL AND ({})",
            quote_ident(&def.table),
            def.predicate
        );
        let (initial_pending,): (i64,) = sqlx::query_as(&count_sql)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| invalid(format!("predicate {:?}: {e}", def.predicate)))?;
        drop(conn);

        let now = now_secs();
        let job = BackfillJob {
            job_id: def.job_id.clone(),
            target_table: def.table.clone(),
            target_columns: def.columns.clone(),
            key_column: def.key_column.clone(),
            predicate: def.predicate.clone(),
            batch_size: def.batch_size,
            checkpoint_cursor: None,
            checkpoint_rowid: None,
            rows_examined_total: 0,
            rows_updated_total: 0,
            rows_skipped_total: 0,
            initial_pending,
            status: JobStatus::Created,
            error_detail: None,
            started_at: now,
            completed_at: None,
            row_version: 1,
            updated_at: now,
        };
        self.db.insert_backfill_job(&job).await?;
        info!(job_id = %job.job_id, table = %job.target_table, initial_pending, "backfill job created");
        Ok(job)
    }

    /// Rows still matching the predicate past the job's cursor.
    pub async fn remaining(&self, job: &BackfillJob) -> DbResult<i64> {
        let key = quote_ident(&job.key_column);
        let mut sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {key} IS NOT NULL AND ({})",
            quote_ident(&job.target_table),
            job.predicate
        );
        if job.checkpoint_cursor.is_some() {
            sql.push_str(&past_cursor(&key));
        }
        let q = bind_cursor(sqlx::query(&sql), job);
        let row = q.fetch_one(self.db.pool()).await?;
        Ok(row.try_get(0)?)
    }

    /// Process one batch of `job` and commit it together with the new
    /// checkpoint. A rate limit or upstream timeout is returned as an
    /// upstream error and nothing is written.
    pub async fn run_batch(
        &self,
        job: &mut BackfillJob,
        transform: &dyn RowTransform,
    ) -> DbResult<BatchResult> {
        let mut memo = BatchMemo::new();
        match self.try_batch(job, transform, &mut memo).await {
            Ok(r) => Ok(r),
            Err(BatchFailure::RateLimited(retry_after)) => {
                Err(DbError::Upstream(UpstreamError::RateLimited { retry_after }))
            }
            Err(BatchFailure::UpstreamTimeout(after)) => {
                Err(DbError::Upstream(UpstreamError::Timeout(after)))
            }
            Err(BatchFailure::Error(e)) => Err(e),
        }
    }

    /// Reload the persisted job and run batches until nothing remains, the
    /// job is paused, or it fails.
    ///
    /// Holds a lease on every target column for the whole run. A completed
    /// job is returned unchanged.
    pub async fn resume(
        &self,
        job_id: &str,
        transform: &dyn RowTransform,
        cancel: &CancellationToken,
        progress: Option<&JobState>,
    ) -> DbResult<BackfillJob> {
        let job = self
            .db
            .get_backfill_job(job_id)
            .await?
            .ok_or_else(|| DbError::JobNotFound(job_id.to_string()))?;
        if job.status == JobStatus::Completed {
            info!(job_id, "backfill already completed");
            return Ok(job);
        }

        let keys = lock_keys(&job.target_table, &job.target_columns);
        let mut leases = self
            .db
            .acquire_leases(&keys, job_id, self.lease_ttl())
            .await?;

        let result = self.run_locked(job, transform, cancel, progress, &mut leases).await;

        self.db.release_leases(&leases).await;
        result
    }

    /// Mark a job paused from outside the process running it. The runner
    /// notices at the top of its next batch.
    pub async fn pause(&self, job_id: &str) -> DbResult<BackfillJob> {
        let mut job = self
            .db
            .get_backfill_job(job_id)
            .await?
            .ok_or_else(|| DbError::JobNotFound(job_id.to_string()))?;
        if job.status == JobStatus::Paused {
            return Ok(job);
        }
        self.transition(&mut job, JobStatus::Paused, None).await?;
        Ok(job)
    }

    pub async fn list(&self) -> DbResult<Vec<BackfillJob>> {
        self.db.list_backfill_jobs().await
    }

    /// Run `resume` on a task registered with `registry`, reporting progress
    /// through it. Cancelling the handle (or `registry.cancel_all()`)
    /// pauses the job at the next batch boundary.
    pub fn spawn(
        self: &Arc<Self>,
        registry: &JobRegistry,
        job_id: impl Into<String>,
        transform: Arc<dyn RowTransform>,
    ) -> SpawnedBackfill {
        let job_id = job_id.into();
        let runner = Arc::clone(self);
        let (tx, rx) = oneshot::channel();
        let handle = registry.start_job(job_id.clone(), 0, move |state, cancel| async move {
            let result = runner
                .resume(&job_id, transform.as_ref(), &cancel, Some(state.as_ref()))
                .await;
            let status = match &result {
                Ok(job) => Ok(job.status),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(result);
            status
        });
        SpawnedBackfill { handle, result: rx }
    }

    fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lease_ttl_secs)
    }

    async fn run_locked(
        &self,
        mut job: BackfillJob,
        transform: &dyn RowTransform,
        cancel: &CancellationToken,
        progress: Option<&JobState>,
        leases: &mut [Lease],
    ) -> DbResult<BackfillJob> {
        self.transition(&mut job, JobStatus::Running, None).await?;
        info!(
            job_id = %job.job_id,
            table = %job.target_table,
            cursor = ?job.checkpoint_cursor,
            batch_size = job.batch_size,
            transform = transform.name(),
            "backfill running"
        );
        if let Some(p) = progress {
            p.set_total(job.initial_pending.max(0) as u64);
            p.set_current(job.rows_examined_total.max(0) as u64);
        }

        match self.drive(&mut job, transform, cancel, progress, leases).await {
            Ok(()) => Ok(job),
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, cursor = ?job.checkpoint_cursor, "backfill failed");
                // A lost lease means someone else owns the row now
                if !matches!(e, DbError::LockHeld { .. }) {
                    self.record_failure(&job.job_id, &e).await;
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        job: &mut BackfillJob,
        transform: &dyn RowTransform,
        cancel: &CancellationToken,
        progress: Option<&JobState>,
        leases: &mut [Lease],
    ) -> DbResult<()> {
        let backoff = Backoff::new(
            self.config.backoff_base(),
            self.config.backoff_max(),
            self.config.max_rate_limit_retries,
        );
        let mut memo = BatchMemo::new();
        let mut upstream_retries = 0u32;
        let mut timeouts = 0u32;

        loop {
            // Adopt whatever was committed last (including an operator pause)
            *job = self
                .db
                .get_backfill_job(&job.job_id)
                .await?
                .ok_or_else(|| DbError::JobNotFound(job.job_id.clone()))?;
            if job.status == JobStatus::Paused {
                info!(job_id = %job.job_id, "paused by operator");
                return Ok(());
            }
            if cancel.is_cancelled() {
                self.transition(job, JobStatus::Paused, None).await?;
                info!(job_id = %job.job_id, cursor = ?job.checkpoint_cursor, "backfill paused");
                return Ok(());
            }
            self.db.renew_leases(leases, self.lease_ttl()).await?;

            let attempt = tokio::time::timeout(
                self.config.batch_timeout(),
                self.try_batch(job, transform, &mut memo),
            )
            .await;

            match attempt {
                Ok(Ok(batch)) => {
                    memo.clear();
                    upstream_retries = 0;
                    timeouts = 0;
                    if let Some(p) = progress {
                        p.advance(batch.rows_examined);
                        p.set_message(format!(
                            "{} updated, {} skipped",
                            job.rows_updated_total, job.rows_skipped_total
                        ));
                    }
                    if batch.rows_examined == 0 {
                        self.transition(job, JobStatus::Completed, None).await?;
                        info!(
                            job_id = %job.job_id,
                            rows_examined = job.rows_examined_total,
                            rows_updated = job.rows_updated_total,
                            rows_skipped = job.rows_skipped_total,
                            "backfill completed"
                        );
                        return Ok(());
                    }
                }
                Ok(Err(
                    failure @ (BatchFailure::RateLimited(_) | BatchFailure::UpstreamTimeout(_)),
                )) => {
                    upstream_retries += 1;
                    let (retry_after, reason) = match failure {
                        BatchFailure::RateLimited(retry_after) => (retry_after, "rate limited"),
                        _ => (None, "upstream timed out"),
                    };
                    if backoff.exhausted(upstream_retries) {
                        return Err(match failure {
                            BatchFailure::UpstreamTimeout(after) => {
                                DbError::Upstream(UpstreamError::Timeout(after))
                            }
                            _ => DbError::RateLimited {
                                job_id: job.job_id.clone(),
                                attempts: upstream_retries,
                            },
                        });
                    }
                    let delay = backoff.delay(upstream_retries, retry_after);
                    warn!(
                        job_id = %job.job_id,
                        attempt = upstream_retries,
                        delay_ms = delay.as_millis() as u64,
                        memoised = memo.len(),
                        reason,
                        "retrying batch"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Ok(Err(BatchFailure::Error(DbError::StaleWrite { .. }))) => {
                    // The batch rolled back; the reload at the top picks up
                    // whatever changed the row (usually an operator pause)
                    debug!(job_id = %job.job_id, "job row changed during batch, reloading");
                }
                Ok(Err(BatchFailure::Error(e))) => return Err(e),
                Err(_elapsed) => {
                    // The dropped transaction rolled back; nothing of this batch counts
                    memo.clear();
                    timeouts += 1;
                    if timeouts > self.config.max_timeout_retries {
                        return Err(DbError::TimeoutDuringBatch {
                            job_id: job.job_id.clone(),
                            batch_size: job.batch_size,
                            attempts: timeouts,
                        });
                    }
                    warn!(job_id = %job.job_id, batch_size = job.batch_size, timeouts, "batch timed out");
                    if timeouts % 2 == 0 && job.batch_size > 1 {
                        let mut shrunk = self
                            .db
                            .get_backfill_job(&job.job_id)
                            .await?
                            .ok_or_else(|| DbError::JobNotFound(job.job_id.clone()))?;
                        shrunk.batch_size = (shrunk.batch_size / 2).max(1);
                        self.db.save_backfill_job(&mut shrunk).await?;
                        info!(job_id = %job.job_id, batch_size = shrunk.batch_size, "batch size reduced");
                        *job = shrunk;
                    }
                }
            }
        }
    }

    async fn try_batch(
        &self,
        job: &mut BackfillJob,
        transform: &dyn RowTransform,
        memo: &mut BatchMemo,
    ) -> Result<BatchResult, BatchFailure> {
        let rows = self.select_batch(job, transform).await?;

        let mut planned: Vec<(i64, Option<RowPatch>)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let patch = match memo.get(&row.rowid) {
                Some(p) => p.clone(),
                None => {
                    let p = match transform.apply(row).await {
                        Ok(p) => p,
                        Err(TransformError::RateLimited { retry_after }) => {
                            return Err(BatchFailure::RateLimited(retry_after))
                        }
                        Err(TransformError::Timeout(after)) => {
                            return Err(BatchFailure::UpstreamTimeout(after))
                        }
                        Err(TransformError::Upstream(e)) => return Err(DbError::Upstream(e).into()),
                        Err(TransformError::Invalid(detail)) => {
                            return Err(DbError::InvalidJob {
                                job_id: job.job_id.clone(),
                                detail,
                            }
                            .into())
                        }
                    };
                    memo.insert(row.rowid, p.clone());
                    p
                }
            };
            planned.push((row.rowid, patch));
        }

        let mut next = job.clone();
        let mut result = BatchResult {
            rows_examined: rows.len() as u64,
            rows_updated: 0,
            rows_skipped: 0,
            cursor_advanced_to: rows.last().map(|r| r.key.clone()),
        };
        if rows.is_empty() {
            return Ok(result);
        }

        let mut tx = self.db.pool().begin().await?;
        for (rowid, patch) in &planned {
            let Some(patch) = patch else {
                result.rows_skipped += 1;
                continue;
            };
            let sets: Vec<String> = patch
                .keys()
                .map(|col| format!("{} = ?", quote_ident(col)))
                .collect();
            let sql = format!(
                "UPDATE {} SET {} WHERE rowid = ? AND ({})",
                quote_ident(&job.target_table),
                sets.join(", "),
                job.predicate
            );
            let mut q = sqlx::query(&sql);
            for value in patch.values() {
                q = bind_value(q, value);
            }
            q = q.bind(*rowid);
            result.rows_updated += q.execute(&mut *tx).await?.rows_affected();
        }

        next.checkpoint_cursor = result.cursor_advanced_to.clone();
        next.checkpoint_rowid = rows.last().map(|r| r.rowid);
        next.rows_examined_total += result.rows_examined as i64;
        next.rows_updated_total += result.rows_updated as i64;
        next.rows_skipped_total += result.rows_skipped as i64;
        next.updated_at = now_secs();
        write_job(&mut tx, &next).await?;
        tx.commit().await?;

        next.row_version += 1;
        *job = next;
        debug!(
            job_id = %job.job_id,
            rows_examined = result.rows_examined,
            rows_updated = result.rows_updated,
            rows_skipped = result.rows_skipped,
            cursor = ?job.checkpoint_cursor,
            "batch committed"
        );
        Ok(result)
    }

    async fn select_batch(
        &self,
        job: &BackfillJob,
        transform: &dyn RowTransform,
    ) -> Result<Vec<SourceRow>, BatchFailure> {
        let key = quote_ident(&job.key_column);
        let mut sql = format!(
            "SELECT CAST({key} AS TEXT) AS {KEY_TEXT}, typeof({key}) AS {KEY_TYPE}, rowid AS {ROWID}"
        );
        let inputs = transform.inputs();
        for (alias, expr) in &inputs {
            sql.push_str(&format!(", ({expr}) AS {}", quote_ident(alias)));
        }
        sql.push_str(&format!(
            " FROM {} WHERE {key} IS NOT NULL AND ({})",
            quote_ident(&job.target_table),
            job.predicate
        ));
        if job.checkpoint_cursor.is_some() {
            sql.push_str(&past_cursor(&key));
        }
        sql.push_str(&format!(" ORDER BY {key}, rowid LIMIT {}", job.batch_size));

        let q = bind_cursor(sqlx::query(&sql), job);
        let rows = q.fetch_all(self.db.pool()).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let text: String = row.try_get(KEY_TEXT)?;
            let type_name: String = row.try_get(KEY_TYPE)?;
            let key = CursorKey::from_sql(&type_name, text).ok_or_else(|| DbError::InvalidJob {
                job_id: job.job_id.clone(),
                detail: format!("key column {} holds {type_name} values", job.key_column),
            })?;
            let rowid: i64 = row.try_get(ROWID)?;
            let mut values = Map::new();
            for (i, (alias, _)) in inputs.iter().enumerate() {
                values.insert(alias.clone(), column_value(row, i + 3)?);
            }
            out.push(SourceRow { key, rowid, values });
        }
        Ok(out)
    }

    async fn transition(
        &self,
        job: &mut BackfillJob,
        to: JobStatus,
        error_detail: Option<String>,
    ) -> DbResult<()> {
        if !can_transition(job.status, to) {
            return Err(DbError::InvalidTransition {
                entity: "backfill job",
                key: job.job_id.clone(),
                from: job.status.to_string(),
                to: to.to_string(),
            });
        }
        let mut next = job.clone();
        next.status = to;
        next.error_detail = error_detail;
        if to == JobStatus::Completed {
            next.completed_at = Some(now_secs());
        }
        self.db.save_backfill_job(&mut next).await?;
        *job = next;
        Ok(())
    }

    /// Persist `failed` with the error, keeping the last committed cursor.
    async fn record_failure(&self, job_id: &str, error: &DbError) {
        let current = match self.db.get_backfill_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(job_id, error = %e, "could not reload job to record failure");
                return;
            }
        };
        let mut job = current;
        if let Err(e) = self
            .transition(&mut job, JobStatus::Failed, Some(error.to_string()))
            .await
        {
            warn!(job_id, error = %e, "could not record failure");
        }
    }
}

/// Rows strictly after the checkpoint in `(key, rowid)` order. Binds `?1`
/// and `?2` through [`bind_cursor`].
fn past_cursor(key: &str) -> String {
    format!(" AND ({key} > ?1 OR ({key} = ?1 AND rowid > ?2))")
}

fn bind_cursor<'q>(q: SqliteQuery<'q>, job: &BackfillJob) -> SqliteQuery<'q> {
    match &job.checkpoint_cursor {
        // Checkpoints written before rowids were recorded cover the whole key
        Some(cursor) => bind_key(q, cursor).bind(job.checkpoint_rowid.unwrap_or(i64::MAX)),
        None => q,
    }
}

fn bind_key<'q>(q: SqliteQuery<'q>, key: &CursorKey) -> SqliteQuery<'q> {
    match key {
        CursorKey::Int(i) => q.bind(*i),
        CursorKey::Text(s) => q.bind(s.clone()),
    }
}

fn bind_value<'q>(q: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => q.bind(None::<String>),
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => q.bind(i),
            (None, Some(f)) => q.bind(f),
            (None, None) => q.bind(n.to_string()),
        },
        Value::String(s) => q.bind(s.clone()),
        other => q.bind(other.to_string()),
    }
}

/// Read a result column of unknown type as JSON.
fn column_value(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    match type_name.as_str() {
        "INTEGER" => row.try_get::<i64, _>(index).map(Value::from),
        "REAL" => row.try_get::<f64, _>(index).map(Value::from),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map(|b| Value::String(String::from_utf8_lossy(&b).into_owned())),
        _ => row.try_get::<String, _>(index).map(Value::String),
    }
}
