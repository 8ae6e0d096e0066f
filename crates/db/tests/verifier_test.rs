//! Integration tests for the reconciliation verifier.

use darkhorses_core::{ForeignKeyDef, VerificationDef};
use darkhorses_db::{CoverageStatus, Database, DbError, Finding, Verifier};
use pretty_assertions::assert_eq;

async fn seed(db: &Database, sql: &str) {
    sqlx::raw_sql(sql).execute(db.pool()).await.unwrap();
}

/// 1000 horses, the first 950 with a sire.
async fn pedigree(db: &Database) {
    seed(
        db,
        "CREATE TABLE horses (id INTEGER PRIMARY KEY, name TEXT, sire_id INTEGER);
         WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 1000)
         INSERT INTO horses (id, name, sire_id)
           SELECT n, 'horse ' || n, CASE WHEN n <= 950 THEN 1 ELSE NULL END FROM seq;",
    )
    .await;
}

#[tokio::test]
async fn test_coverage_against_threshold() {
    let db = Database::new_in_memory().await.unwrap();
    pedigree(&db).await;
    let columns = vec!["sire_id".to_string(), "name".to_string()];

    let strict = Verifier::new(db.clone()).with_threshold(96.0);
    let report = strict.verify("horses", &columns).await.unwrap();
    assert_eq!(report.total_rows, 1000);
    assert_eq!(report.columns[0].populated_rows, 950);
    assert_eq!(report.columns[0].coverage_pct, 95.0);
    assert_eq!(report.columns[0].status, CoverageStatus::AttentionNeeded);
    assert_eq!(report.columns[1].coverage_pct, 100.0);
    assert_eq!(report.columns[1].status, CoverageStatus::Ok);
    assert_eq!(report.findings.len(), 1);
    assert!(matches!(
        &report.findings[0],
        Finding::CoverageBelowThreshold { column, .. } if column == "sire_id"
    ));

    let lenient = Verifier::new(db).with_threshold(95.0);
    let report = lenient.verify("horses", &columns).await.unwrap();
    assert_eq!(report.columns[0].status, CoverageStatus::Ok);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_empty_table_counts_as_covered() {
    let db = Database::new_in_memory().await.unwrap();
    seed(&db, "CREATE TABLE races (id INTEGER PRIMARY KEY, going TEXT);").await;
    let report = Verifier::new(db)
        .verify("races", &["going".to_string()])
        .await
        .unwrap();
    assert_eq!(report.total_rows, 0);
    assert_eq!(report.columns[0].coverage_pct, 100.0);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_missing_table_is_an_error() {
    let db = Database::new_in_memory().await.unwrap();
    let err = Verifier::new(db)
        .verify("nope", &["x".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MissingObject(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unknown_column_is_an_error() {
    let db = Database::new_in_memory().await.unwrap();
    pedigree(&db).await;
    let verifier = Verifier::new(db);

    let err = verifier
        .verify("horses", &["sire_id".to_string(), "dam_id".to_string()])
        .await
        .unwrap_err();
    match err {
        DbError::MissingObject(what) => assert_eq!(what, "column horses.dam_id"),
        other => panic!("expected MissingObject, got {other:?}"),
    }

    let err = verifier
        .verify_no_duplicates("horses", &["api_id".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MissingObject(_)), "got {err:?}");

    let fk = ForeignKeyDef {
        column: "dam_id".into(),
        parent_table: "horses".into(),
        parent_column: "id".into(),
    };
    let err = verifier.verify_referential_integrity("horses", &fk).await.unwrap_err();
    assert!(matches!(err, DbError::MissingObject(_)), "got {err:?}");
}

#[tokio::test]
async fn test_orphans_and_duplicates() {
    let db = Database::new_in_memory().await.unwrap();
    seed(
        &db,
        "CREATE TABLE horses (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE runners (id INTEGER PRIMARY KEY, race_id INTEGER, horse_id INTEGER);
         INSERT INTO horses (id, name) VALUES (1, 'Arkle'), (2, 'Mill House');
         INSERT INTO runners (race_id, horse_id) VALUES
           (10, 1), (10, 2), (10, 3), (11, 4), (11, NULL), (11, 1), (10, 1);",
    )
    .await;
    let verifier = Verifier::new(db);

    let fk = ForeignKeyDef {
        column: "horse_id".into(),
        parent_table: "horses".into(),
        parent_column: "id".into(),
    };
    assert_eq!(verifier.verify_referential_integrity("runners", &fk).await.unwrap(), 2);

    // (10, 1) twice; the NULL horse row is not compared
    let key = vec!["race_id".to_string(), "horse_id".to_string()];
    assert_eq!(verifier.verify_no_duplicates("runners", &key).await.unwrap(), 1);
    assert_eq!(verifier.verify_no_duplicates("runners", &[]).await.unwrap(), 0);

    let report = verifier
        .run(&VerificationDef {
            table: "runners".into(),
            columns: vec!["horse_id".into()],
            coverage_threshold: Some(80.0),
            unique_keys: vec![key],
            foreign_keys: vec![fk],
        })
        .await
        .unwrap();
    assert_eq!(report.threshold, 80.0);
    assert_eq!(report.referential_integrity_violations, 2);
    assert_eq!(report.duplicate_groups, 1);
    // 6/7 populated is above 80%
    assert_eq!(report.findings.len(), 2);
    assert!(!report.is_clean());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["findings"][0]["kind"], "referential_integrity_violation");
    assert_eq!(json["columns"][0]["status"], "OK");
}

#[tokio::test]
async fn test_declared_foreign_keys_are_checked() {
    let db = Database::new_in_memory().await.unwrap();
    seed(
        &db,
        "PRAGMA foreign_keys = OFF;
         CREATE TABLE horses (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE results (id INTEGER PRIMARY KEY, horse_id INTEGER REFERENCES horses);
         INSERT INTO horses (id, name) VALUES (1, 'Arkle');
         INSERT INTO results (horse_id) VALUES (1), (9), (9);",
    )
    .await;
    let checked = Verifier::new(db)
        .verify_declared_foreign_keys("results")
        .await
        .unwrap();
    assert_eq!(checked.len(), 1);
    let (fk, violations) = &checked[0];
    assert_eq!(fk.parent_table, "horses");
    assert_eq!(fk.parent_column, "id", "resolved to the parent's primary key");
    assert_eq!(*violations, 2);
}
