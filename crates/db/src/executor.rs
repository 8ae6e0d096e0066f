// crates/db/src/executor.rs
//! Migration step executor.
//!
//! Each step is checked against the live catalog before it runs, so re-running
//! a half-finished migration converges instead of erroring. Anything the
//! executor cannot classify as "not done" or "already done" (a rename where
//! both names exist, a drop against live data) stops with a manual
//! intervention error.

use std::collections::HashMap;
use std::time::Duration;

use darkhorses_core::{ColumnDef, MigrationDef, Plan, Step};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::catalog::{self, types_compatible};
use crate::ledger::MigrationStatus;
use crate::{quote_ident, Database, DbError, DbResult};

pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// What a step did to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "detail", rename_all = "snake_case")]
pub enum StepAction {
    Applied,
    /// The catalog already matched the step's post-condition.
    AlreadyApplied,
    /// An optional index could not be built. The migration still succeeds.
    OptionalFailed(String),
}

/// Result of one step, with the before/after counts of the table it touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub version: i64,
    pub step: String,
    pub action: StepAction,
    /// Data rows (or non-NULL values) the step removed. Zero for additive DDL.
    pub rows_affected: i64,
    pub rows_before: Option<i64>,
    pub rows_after: Option<i64>,
    pub columns_before: Option<usize>,
    pub columns_after: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationSummary {
    pub dry_run: bool,
    /// Versions applied by this run.
    pub applied: Vec<i64>,
    /// Versions the ledger already held with a matching checksum.
    pub skipped: Vec<i64>,
    /// Versions that would run (dry run) or are still pending.
    pub pending: Vec<i64>,
    pub steps: Vec<StepOutcome>,
    pub warnings: Vec<String>,
}

impl MigrationSummary {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.pending.is_empty()
    }
}

pub struct MigrationExecutor {
    db: Database,
    statement_timeout: Duration,
}

impl MigrationExecutor {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
        }
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Migrations of `plan` that still have to run, in order.
    ///
    /// Reads the ledger once. Fails on checksum drift or when a pending
    /// version sorts below one that is already applied.
    pub async fn pending<'p>(&self, plan: &'p Plan) -> DbResult<Vec<&'p MigrationDef>> {
        self.classify(plan).await.map(|(pending, _)| pending)
    }

    async fn classify<'p>(&self, plan: &'p Plan) -> DbResult<(Vec<&'p MigrationDef>, Vec<i64>)> {
        let ledger: HashMap<i64, _> = self
            .db
            .ledger_entries()
            .await?
            .into_iter()
            .map(|r| (r.version, r))
            .collect();
        let latest = ledger
            .values()
            .filter(|r| r.status == MigrationStatus::Applied)
            .map(|r| r.version)
            .max();

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for m in &plan.migrations {
            let checksum = m.checksum();
            match ledger.get(&m.version) {
                Some(rec) if rec.status == MigrationStatus::Applied => {
                    if rec.checksum != checksum {
                        return Err(DbError::DuplicateVersion {
                            version: m.version,
                            recorded: rec.checksum.clone(),
                            checksum,
                        });
                    }
                    skipped.push(m.version);
                }
                _ => {
                    if let Some(latest) = latest {
                        if m.version < latest {
                            return Err(DbError::OutOfOrderVersion {
                                version: m.version,
                                latest,
                            });
                        }
                    }
                    pending.push(m);
                }
            }
        }
        Ok((pending, skipped))
    }

    /// Apply every pending migration of `plan`, in version order.
    ///
    /// With nothing pending this costs the bootstrap plus one ledger read.
    pub async fn apply_plan(&self, plan: &Plan, dry_run: bool) -> DbResult<MigrationSummary> {
        self.db.bootstrap().await?;
        let (pending, skipped) = self.classify(plan).await?;

        let mut summary = MigrationSummary {
            dry_run,
            skipped,
            ..Default::default()
        };

        if dry_run {
            summary.pending = pending.iter().map(|m| m.version).collect();
            return Ok(summary);
        }
        if pending.is_empty() {
            debug!("no pending migrations");
            return Ok(summary);
        }

        for m in pending {
            let outcomes = self.apply_migration(m).await?;
            for o in &outcomes {
                if let StepAction::OptionalFailed(reason) = &o.action {
                    summary
                        .warnings
                        .push(format!("migration {}: {}: {reason}", o.version, o.step));
                }
            }
            summary.applied.push(m.version);
            summary.steps.extend(outcomes);
        }
        Ok(summary)
    }

    /// Run one migration's steps between `record_attempt` and `mark_applied`.
    /// Any step error marks the version failed and is returned unchanged.
    pub async fn apply_migration(&self, m: &MigrationDef) -> DbResult<Vec<StepOutcome>> {
        let record = self
            .db
            .record_attempt(m.version, &m.description, &m.checksum())
            .await?;
        if record.status == MigrationStatus::Applied {
            return Ok(Vec::new());
        }

        info!(version = m.version, description = %m.description, steps = m.steps.len(), "applying migration");
        let mut outcomes = Vec::with_capacity(m.steps.len());
        for step in &m.steps {
            match self.apply_step(m.version, step).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(version = m.version, step = %step.describe(), error = %e, "migration failed");
                    self.db.mark_failed(m.version, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }
        self.db.mark_applied(m.version).await?;
        info!(version = m.version, "migration applied");
        Ok(outcomes)
    }

    /// Apply a single step in its own transaction, bounded by the statement timeout.
    pub async fn apply_step(&self, version: i64, step: &Step) -> DbResult<StepOutcome> {
        let optional_index = matches!(step, Step::AddIndex { optional: true, .. });
        match tokio::time::timeout(self.statement_timeout, self.run_step(version, step)).await {
            Ok(result) => result,
            Err(_) if optional_index => {
                let reason = format!(
                    "timed out after {}ms",
                    self.statement_timeout.as_millis()
                );
                warn!(version, step = %step.describe(), %reason, "optional index skipped");
                Ok(StepOutcome {
                    version,
                    step: step.describe(),
                    action: StepAction::OptionalFailed(reason),
                    rows_affected: 0,
                    rows_before: None,
                    rows_after: None,
                    columns_before: None,
                    columns_after: None,
                })
            }
            Err(_) => Err(DbError::StatementTimeout {
                what: step.describe(),
                timeout_ms: self.statement_timeout.as_millis() as u64,
            }),
        }
    }

    async fn run_step(&self, version: i64, step: &Step) -> DbResult<StepOutcome> {
        let (table_before, table_after) = step_tables(step);
        let mut tx = self.db.pool().begin().await?;

        let before = catalog::table_shape(&mut tx, table_before).await?;
        let (action, rows_affected) = match step {
            Step::CreateTable { table, columns } => (create_table(&mut tx, table, columns).await?, 0),
            Step::AddColumn {
                table,
                column,
                data_type,
                nullable,
                default,
            } => (
                add_column(&mut tx, table, column, data_type, *nullable, default.as_deref()).await?,
                0,
            ),
            Step::RenameColumn { table, from, to } => {
                (rename_column(&mut tx, table, from, to).await?, 0)
            }
            Step::RenameTable { from, to } => (rename_table(&mut tx, from, to).await?, 0),
            Step::DropColumn {
                table,
                column,
                require_empty,
            } => drop_column(&mut tx, table, column, *require_empty).await?,
            Step::DropTable {
                table,
                require_empty,
            } => drop_table(&mut tx, table, *require_empty).await?,
            Step::AddIndex {
                name,
                table,
                columns,
                unique,
                optional,
            } => (
                add_index(&mut tx, name, table, columns, *unique, *optional).await?,
                0,
            ),
        };
        let after = catalog::table_shape(&mut tx, table_after).await?;
        tx.commit().await?;

        let outcome = StepOutcome {
            version,
            step: step.describe(),
            action,
            rows_affected,
            rows_before: before.map(|(r, _)| r),
            rows_after: after.map(|(r, _)| r),
            columns_before: before.map(|(_, c)| c),
            columns_after: after.map(|(_, c)| c),
        };
        info!(
            version,
            step = %outcome.step,
            action = ?outcome.action,
            rows_affected = outcome.rows_affected,
            rows_before = ?outcome.rows_before,
            rows_after = ?outcome.rows_after,
            columns_before = ?outcome.columns_before,
            columns_after = ?outcome.columns_after,
            "step finished"
        );
        Ok(outcome)
    }
}

/// Table observed before and after the step (differs only for table renames).
fn step_tables(step: &Step) -> (&str, &str) {
    match step {
        Step::RenameTable { from, to } => (from.as_str(), to.as_str()),
        Step::CreateTable { table, .. }
        | Step::AddColumn { table, .. }
        | Step::RenameColumn { table, .. }
        | Step::DropColumn { table, .. }
        | Step::DropTable { table, .. }
        | Step::AddIndex { table, .. } => (table.as_str(), table.as_str()),
    }
}

fn column_sql(c: &ColumnDef, inline_pk: bool) -> String {
    let mut sql = format!("{} {}", quote_ident(&c.name), c.data_type);
    if inline_pk && c.primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if !c.nullable && !c.primary_key {
        sql.push_str(" NOT NULL");
    }
    if let Some(d) = &c.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(d);
    }
    if let Some(r) = &c.references {
        sql.push_str(&format!(
            " REFERENCES {}({})",
            quote_ident(&r.table),
            quote_ident(&r.column)
        ));
    }
    sql
}

async fn create_table(
    conn: &mut SqliteConnection,
    table: &str,
    columns: &[ColumnDef],
) -> DbResult<StepAction> {
    if catalog::table_exists(conn, table).await? {
        let existing = catalog::columns(conn, table).await?;
        for c in columns {
            match existing.iter().find(|e| e.name.eq_ignore_ascii_case(&c.name)) {
                None => {
                    return Err(DbError::SchemaConflict {
                        object: table.to_string(),
                        detail: format!("table exists without column {}", c.name),
                    })
                }
                Some(e) if !types_compatible(&e.data_type, &c.data_type) => {
                    return Err(DbError::SchemaConflict {
                        object: format!("{table}.{}", c.name),
                        detail: format!("existing type {} vs declared {}", e.data_type, c.data_type),
                    })
                }
                Some(_) => {}
            }
        }
        return Ok(StepAction::AlreadyApplied);
    }

    let pks: Vec<&ColumnDef> = columns.iter().filter(|c| c.primary_key).collect();
    let inline_pk = pks.len() == 1;
    let mut parts: Vec<String> = columns.iter().map(|c| column_sql(c, inline_pk)).collect();
    if pks.len() > 1 {
        let names: Vec<String> = pks.iter().map(|c| quote_ident(&c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }
    let ddl = format!("CREATE TABLE {} ({})", quote_ident(table), parts.join(", "));
    sqlx::query(&ddl).execute(&mut *conn).await?;
    Ok(StepAction::Applied)
}

async fn add_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    data_type: &str,
    nullable: bool,
    default: Option<&str>,
) -> DbResult<StepAction> {
    if !catalog::table_exists(conn, table).await? {
        return Err(DbError::SchemaConflict {
            object: table.to_string(),
            detail: "table does not exist".into(),
        });
    }
    if let Some(existing) = catalog::column(conn, table, column).await? {
        if types_compatible(&existing.data_type, data_type) {
            return Ok(StepAction::AlreadyApplied);
        }
        return Err(DbError::SchemaConflict {
            object: format!("{table}.{column}"),
            detail: format!("exists as {} but {data_type} was requested", existing.data_type),
        });
    }

    let mut ddl = format!(
        "ALTER TABLE {} ADD COLUMN {} {data_type}",
        quote_ident(table),
        quote_ident(column)
    );
    if !nullable {
        ddl.push_str(" NOT NULL");
    }
    if let Some(d) = default {
        ddl.push_str(" DEFAULT ");
        ddl.push_str(d);
    }
    sqlx::query(&ddl).execute(&mut *conn).await?;
    Ok(StepAction::Applied)
}

async fn rename_column(
    conn: &mut SqliteConnection,
    table: &str,
    from: &str,
    to: &str,
) -> DbResult<StepAction> {
    if !catalog::table_exists(conn, table).await? {
        return Err(DbError::ManualInterventionRequired(format!(
            "cannot rename {table}.{from}: table {table} does not exist"
        )));
    }
    let old_exists = catalog::column(conn, table, from).await?.is_some();
    let new_exists = catalog::column(conn, table, to).await?.is_some();

    let mut action = match (old_exists, new_exists) {
        (true, false) => {
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            ))
            .execute(&mut *conn)
            .await?;
            StepAction::Applied
        }
        (false, true) => StepAction::AlreadyApplied,
        (true, true) => {
            return Err(DbError::ManualInterventionRequired(format!(
                "both {table}.{from} and {table}.{to} exist; cannot tell which one holds the data"
            )))
        }
        (false, false) => {
            return Err(DbError::ManualInterventionRequired(format!(
                "neither {table}.{from} nor {table}.{to} exists"
            )))
        }
    };

    if rename_dependent_indexes(conn, table, from, to, Some(to)).await? > 0 {
        action = StepAction::Applied;
    }
    verify_column_rename(conn, table, from, to).await?;
    Ok(action)
}

async fn rename_table(conn: &mut SqliteConnection, from: &str, to: &str) -> DbResult<StepAction> {
    let old_exists = catalog::table_exists(conn, from).await?;
    let new_exists = catalog::table_exists(conn, to).await?;

    let mut action = match (old_exists, new_exists) {
        (true, false) => {
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(from),
                quote_ident(to)
            ))
            .execute(&mut *conn)
            .await?;
            StepAction::Applied
        }
        (false, true) => StepAction::AlreadyApplied,
        (true, true) => {
            return Err(DbError::ManualInterventionRequired(format!(
                "both tables {from} and {to} exist; cannot tell which one holds the data"
            )))
        }
        (false, false) => {
            return Err(DbError::ManualInterventionRequired(format!(
                "neither table {from} nor {to} exists"
            )))
        }
    };

    if rename_dependent_indexes(conn, to, from, to, None).await? > 0 {
        action = StepAction::Applied;
    }
    verify_table_rename(conn, from, to).await?;
    Ok(action)
}

/// Recreate every explicit index on `table` whose name embeds `old` under the
/// new name. SQLite already rewrites column and table references inside the
/// index definition on rename; only the index name needs to follow.
///
/// With `covering` set, only indexes over that column are touched: after
/// `id -> horse_id`, `idx_horses_sire_id` keeps its name.
async fn rename_dependent_indexes(
    conn: &mut SqliteConnection,
    table: &str,
    old: &str,
    new: &str,
    covering: Option<&str>,
) -> DbResult<usize> {
    let mut renamed = 0;
    for idx in catalog::indexes(conn, table).await? {
        if idx.implicit || covering.is_some_and(|c| !indexes_column(&idx, c)) {
            continue;
        }
        let Some(new_name) = rename_identifier_in(&idx.name, old, new) else {
            continue;
        };
        let Some(sql) = idx.sql.as_deref() else {
            continue;
        };
        // The index name is the first identifier after CREATE [UNIQUE] INDEX
        let recreated = sql.replacen(&idx.name, &new_name, 1);
        sqlx::query(&format!("DROP INDEX {}", quote_ident(&idx.name)))
            .execute(&mut *conn)
            .await?;
        sqlx::query(&recreated).execute(&mut *conn).await?;
        info!(table, index = %idx.name, renamed_to = %new_name, "index renamed");
        renamed += 1;
    }
    Ok(renamed)
}

async fn verify_column_rename(
    conn: &mut SqliteConnection,
    table: &str,
    from: &str,
    to: &str,
) -> DbResult<()> {
    let incomplete = |detail: String| {
        DbError::ManualInterventionRequired(format!(
            "rename {table}.{from} -> {to} incomplete: {detail}"
        ))
    };

    let cols = catalog::columns(conn, table).await?;
    if cols.iter().any(|c| c.name.eq_ignore_ascii_case(from)) {
        return Err(incomplete(format!("column {from} still present")));
    }
    if !cols.iter().any(|c| c.name.eq_ignore_ascii_case(to)) {
        return Err(incomplete(format!("column {to} missing")));
    }
    for idx in catalog::indexes(conn, table).await? {
        if !idx.implicit
            && indexes_column(&idx, to)
            && rename_identifier_in(&idx.name, from, to).is_some()
        {
            return Err(incomplete(format!("index {} still named after {from}", idx.name)));
        }
        if let Some(c) = idx
            .columns
            .iter()
            .find(|c| !cols.iter().any(|col| col.name.eq_ignore_ascii_case(c)))
        {
            return Err(incomplete(format!("index {} references missing column {c}", idx.name)));
        }
    }
    for fk in catalog::foreign_keys(conn, table).await? {
        if fk.column.eq_ignore_ascii_case(from) {
            return Err(incomplete(format!("foreign key still uses {table}.{from}")));
        }
    }
    for fk in catalog::referencing_foreign_keys(conn, table).await? {
        if fk
            .parent_column
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(from))
        {
            return Err(incomplete(format!(
                "{}.{} still references {table}.{from}",
                fk.table, fk.column
            )));
        }
    }
    Ok(())
}

async fn verify_table_rename(conn: &mut SqliteConnection, from: &str, to: &str) -> DbResult<()> {
    let incomplete = |detail: String| {
        DbError::ManualInterventionRequired(format!("rename {from} -> {to} incomplete: {detail}"))
    };

    if catalog::table_exists(conn, from).await? {
        return Err(incomplete(format!("table {from} still present")));
    }
    if !catalog::table_exists(conn, to).await? {
        return Err(incomplete(format!("table {to} missing")));
    }
    for idx in catalog::indexes(conn, to).await? {
        if !idx.implicit && rename_identifier_in(&idx.name, from, to).is_some() {
            return Err(incomplete(format!("index {} still named after {from}", idx.name)));
        }
    }
    let dangling = catalog::referencing_foreign_keys(conn, from).await?;
    if let Some(fk) = dangling.first() {
        return Err(incomplete(format!(
            "{}.{} still references {from}",
            fk.table, fk.column
        )));
    }
    Ok(())
}

async fn drop_column(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    require_empty: bool,
) -> DbResult<(StepAction, i64)> {
    if !catalog::table_exists(conn, table).await?
        || catalog::column(conn, table, column).await?.is_none()
    {
        return Ok((StepAction::AlreadyApplied, 0));
    }
    let populated = catalog::count_non_null(conn, table, column).await?;
    info!(table, column, populated, "dropping column");
    if require_empty && populated > 0 {
        return Err(DbError::UnsafeDrop {
            object: format!("{table}.{column}"),
            count: populated,
        });
    }

    for idx in catalog::indexes(conn, table).await? {
        if !idx.implicit && idx.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            sqlx::query(&format!("DROP INDEX {}", quote_ident(&idx.name)))
                .execute(&mut *conn)
                .await?;
            info!(table, index = %idx.name, "dropped index covering column");
        }
    }
    sqlx::query(&format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table),
        quote_ident(column)
    ))
    .execute(&mut *conn)
    .await?;
    Ok((StepAction::Applied, populated))
}

async fn drop_table(
    conn: &mut SqliteConnection,
    table: &str,
    require_empty: bool,
) -> DbResult<(StepAction, i64)> {
    if !catalog::table_exists(conn, table).await? {
        return Ok((StepAction::AlreadyApplied, 0));
    }
    let rows = catalog::count_rows(conn, table).await?;
    info!(table, rows, "dropping table");
    if require_empty && rows > 0 {
        return Err(DbError::UnsafeDrop {
            object: table.to_string(),
            count: rows,
        });
    }
    sqlx::query(&format!("DROP TABLE {}", quote_ident(table)))
        .execute(&mut *conn)
        .await?;
    Ok((StepAction::Applied, rows))
}

async fn add_index(
    conn: &mut SqliteConnection,
    name: &str,
    table: &str,
    columns: &[String],
    unique: bool,
    optional: bool,
) -> DbResult<StepAction> {
    let existing = catalog::indexes(conn, table).await?;
    if let Some(idx) = existing.iter().find(|i| i.name.eq_ignore_ascii_case(name)) {
        let same_columns = idx.columns.len() == columns.len()
            && idx
                .columns
                .iter()
                .zip(columns)
                .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if same_columns && idx.unique == unique {
            return Ok(StepAction::AlreadyApplied);
        }
        return Err(DbError::SchemaConflict {
            object: name.to_string(),
            detail: format!("index exists on ({})", idx.columns.join(", ")),
        });
    }

    let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let ddl = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if unique { "UNIQUE " } else { "" },
        quote_ident(name),
        quote_ident(table),
        cols.join(", ")
    );
    match sqlx::query(&ddl).execute(&mut *conn).await {
        Ok(_) => Ok(StepAction::Applied),
        Err(e) if optional => {
            warn!(index = name, table, error = %e, "optional index failed to build");
            Ok(StepAction::OptionalFailed(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn indexes_column(idx: &catalog::IndexInfo, column: &str) -> bool {
    idx.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
}

/// Replace the first occurrence of `old` in `name` that sits on `_`
/// boundaries, skipping occurrences that are already part of `new`.
///
/// `idx_horses_age` with `age -> horse_age` gives `idx_horses_horse_age`, and
/// applying the same rename again gives `None`.
pub fn rename_identifier_in(name: &str, old: &str, new: &str) -> Option<String> {
    let new_spans = bounded_matches(name, new);
    let (start, end) = bounded_matches(name, old)
        .into_iter()
        .find(|&(s, e)| !new_spans.iter().any(|&(ns, ne)| ns <= s && e <= ne))?;
    Some(format!("{}{new}{}", &name[..start], &name[end..]))
}

fn bounded_matches(hay: &str, needle: &str) -> Vec<(usize, usize)> {
    if needle.is_empty() {
        return Vec::new();
    }
    let bytes = hay.as_bytes();
    hay.match_indices(needle)
        .map(|(start, m)| (start, start + m.len()))
        .filter(|&(start, end)| {
            (start == 0 || bytes[start - 1] == b'_') && (end == hay.len() || bytes[end] == b'_')
        })
        .collect()
}
