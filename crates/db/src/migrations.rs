/// Ledger version 0: the engine's own bookkeeping tables.
///
/// Executed as one multi-statement script inside a transaction. Every
/// statement is guarded, so re-running it against an existing database
/// changes nothing.
pub const BOOTSTRAP: &str = r#"
CREATE TABLE IF NOT EXISTS _schema_ledger (
    version       INTEGER PRIMARY KEY,
    description   TEXT NOT NULL,
    checksum      TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('pending', 'applied', 'failed', 'rolled_back')),
    attempted_at  INTEGER NOT NULL,
    applied_at    INTEGER,
    error_detail  TEXT,
    row_version   INTEGER NOT NULL DEFAULT 1,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _backfill_jobs (
    job_id               TEXT PRIMARY KEY,
    target_table         TEXT NOT NULL,
    target_columns       TEXT NOT NULL,
    key_column           TEXT NOT NULL,
    predicate            TEXT NOT NULL,
    batch_size           INTEGER NOT NULL CHECK (batch_size > 0),
    checkpoint_kind      TEXT CHECK (checkpoint_kind IN ('int', 'text')),
    checkpoint_cursor    TEXT,
    checkpoint_rowid     INTEGER,
    rows_examined_total  INTEGER NOT NULL DEFAULT 0,
    rows_updated_total   INTEGER NOT NULL DEFAULT 0,
    rows_skipped_total   INTEGER NOT NULL DEFAULT 0,
    initial_pending      INTEGER NOT NULL DEFAULT 0,
    status               TEXT NOT NULL CHECK (status IN ('created', 'running', 'paused', 'completed', 'failed')),
    error_detail         TEXT,
    started_at           INTEGER NOT NULL,
    completed_at         INTEGER,
    row_version          INTEGER NOT NULL DEFAULT 1,
    updated_at           INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS _backfill_locks (
    lock_key     TEXT PRIMARY KEY,
    job_id       TEXT NOT NULL,
    owner        TEXT NOT NULL,
    acquired_at  INTEGER NOT NULL,
    expires_at   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_backfill_jobs_status ON _backfill_jobs(status);

INSERT OR IGNORE INTO _schema_ledger (version, description, checksum, status, attempted_at, applied_at, updated_at)
VALUES (0, 'bootstrap migration ledger', 'bootstrap-v1', 'applied',
        strftime('%s', 'now'), strftime('%s', 'now'), strftime('%s', 'now'));
"#;
