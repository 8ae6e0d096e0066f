//! Integration tests for the migration ledger.

use darkhorses_db::{Database, DbError, MigrationStatus};
use futures_util::TryStreamExt;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_attempt_then_applied() {
    let db = Database::new_in_memory().await.unwrap();

    let rec = db.record_attempt(1, "create horses", "abc").await.unwrap();
    assert_eq!(rec.status, MigrationStatus::Pending);
    assert_eq!(rec.applied_at, None);

    let rec = db.mark_applied(1).await.unwrap();
    assert_eq!(rec.status, MigrationStatus::Applied);
    assert!(rec.applied_at.is_some());
    assert_eq!(db.latest_applied_version().await.unwrap(), Some(1));

    // Second mark is a no-op, not an error
    let again = db.mark_applied(1).await.unwrap();
    assert_eq!(again.row_version, rec.row_version);
}

#[tokio::test]
async fn test_reattempt_of_applied_version_is_noop() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(1, "create horses", "abc").await.unwrap();
    let applied = db.mark_applied(1).await.unwrap();

    let rec = db.record_attempt(1, "create horses", "abc").await.unwrap();
    assert_eq!(rec, applied);
}

#[tokio::test]
async fn test_checksum_drift_is_duplicate_version() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(18, "add pedigree columns", "v1").await.unwrap();
    db.mark_applied(18).await.unwrap();

    let err = db
        .record_attempt(18, "add pedigree columns (take 2)", "v2")
        .await
        .unwrap_err();
    match err {
        DbError::DuplicateVersion {
            version,
            recorded,
            checksum,
        } => {
            assert_eq!(version, 18);
            assert_eq!(recorded, "v1");
            assert_eq!(checksum, "v2");
        }
        other => panic!("expected DuplicateVersion, got {other:?}"),
    }
    // The applied record is untouched
    let rec = db.get_migration(18).await.unwrap().unwrap();
    assert_eq!(rec.checksum, "v1");
    assert_eq!(rec.status, MigrationStatus::Applied);
}

#[tokio::test]
async fn test_out_of_order_version_rejected() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(5, "five", "c5").await.unwrap();
    db.mark_applied(5).await.unwrap();

    let err = db.record_attempt(3, "three", "c3").await.unwrap_err();
    assert!(matches!(
        err,
        DbError::OutOfOrderVersion {
            version: 3,
            latest: 5
        }
    ));
    assert!(db.get_migration(3).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_then_retried() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(2, "rename age", "c2").await.unwrap();
    let failed = db.mark_failed(2, "both columns exist").await.unwrap();
    assert_eq!(failed.status, MigrationStatus::Failed);
    assert_eq!(failed.error_detail.as_deref(), Some("both columns exist"));

    // Idempotent terminal status
    let again = db.mark_failed(2, "something else").await.unwrap();
    assert_eq!(again.error_detail.as_deref(), Some("both columns exist"));

    // Cannot jump from failed to applied without a new attempt
    assert!(matches!(
        db.mark_applied(2).await.unwrap_err(),
        DbError::InvalidTransition { .. }
    ));

    let retry = db.record_attempt(2, "rename age", "c2").await.unwrap();
    assert_eq!(retry.status, MigrationStatus::Pending);
    assert_eq!(retry.error_detail, None);
    db.mark_applied(2).await.unwrap();
}

#[tokio::test]
async fn test_rollback_allows_reapply() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(1, "a", "c1").await.unwrap();
    db.mark_applied(1).await.unwrap();

    let rec = db.mark_rolled_back(1).await.unwrap();
    assert_eq!(rec.status, MigrationStatus::RolledBack);
    assert_eq!(db.latest_applied_version().await.unwrap(), Some(0));

    let rec = db.record_attempt(1, "a", "c1-edited").await.unwrap();
    assert_eq!(rec.status, MigrationStatus::Pending);
    assert_eq!(rec.checksum, "c1-edited");
}

#[tokio::test]
async fn test_rollback_of_pending_rejected() {
    let db = Database::new_in_memory().await.unwrap();
    db.record_attempt(1, "a", "c1").await.unwrap();
    assert!(matches!(
        db.mark_rolled_back(1).await.unwrap_err(),
        DbError::InvalidTransition { .. }
    ));
    assert!(matches!(
        db.mark_rolled_back(42).await.unwrap_err(),
        DbError::MigrationNotFound(42)
    ));
}

#[tokio::test]
async fn test_history_is_ordered_and_restartable() {
    let db = Database::new_in_memory().await.unwrap();
    // More than one page
    for v in 1..=230 {
        db.record_attempt(v, &format!("m{v}"), &format!("c{v}"))
            .await
            .unwrap();
        db.mark_applied(v).await.unwrap();
    }

    let all: Vec<_> = db.history().try_collect().await.unwrap();
    assert_eq!(all.len(), 231, "bootstrap record plus 230 migrations");
    assert_eq!(all[0].version, 0);
    assert!(all.windows(2).all(|w| w[0].version < w[1].version));

    let tail: Vec<_> = db.history_from(Some(200)).try_collect().await.unwrap();
    let versions: Vec<i64> = tail.iter().map(|r| r.version).collect();
    assert_eq!(versions, (201..=230).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_ledger_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("ledger.db");
    {
        let db = Database::new(&path).await.unwrap();
        db.record_attempt(1, "a", "c1").await.unwrap();
        db.mark_applied(1).await.unwrap();
    }
    let db = Database::new(&path).await.unwrap();
    assert_eq!(db.latest_applied_version().await.unwrap(), Some(1));
    assert_eq!(db.ledger_entries().await.unwrap().len(), 2);
}
