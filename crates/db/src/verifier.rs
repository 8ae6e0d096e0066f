// crates/db/src/verifier.rs
//! Reconciliation verifier: read-only checks that a migration + backfill left
//! the data complete and consistent.
//!
//! Problems are reported as findings, never raised as errors and never
//! fixed. Errors are reserved for "could not check" (missing table, SQL error).

use darkhorses_core::{ForeignKeyDef, VerificationDef, DEFAULT_COVERAGE_THRESHOLD};
use serde::Serialize;
use sqlx::Row;
use tracing::{info, warn};

use crate::catalog;
use crate::{quote_ident, Database, DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoverageStatus {
    Ok,
    AttentionNeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnCoverage {
    pub column: String,
    pub populated_rows: i64,
    pub coverage_pct: f64,
    pub status: CoverageStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    CoverageBelowThreshold {
        table: String,
        column: String,
        coverage_pct: f64,
        threshold: f64,
    },
    ReferentialIntegrityViolation {
        table: String,
        column: String,
        parent_table: String,
        parent_column: String,
        violations: i64,
    },
    DuplicateKeys {
        table: String,
        columns: Vec<String>,
        duplicate_groups: i64,
    },
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoverageBelowThreshold {
                table,
                column,
                coverage_pct,
                threshold,
            } => write!(
                f,
                "{table}.{column} coverage {coverage_pct:.2}% is below {threshold:.2}%"
            ),
            Self::ReferentialIntegrityViolation {
                table,
                column,
                parent_table,
                parent_column,
                violations,
            } => write!(
                f,
                "{violations} row(s) of {table}.{column} have no parent in {parent_table}.{parent_column}"
            ),
            Self::DuplicateKeys {
                table,
                columns,
                duplicate_groups,
            } => write!(
                f,
                "{duplicate_groups} duplicate group(s) on {table}({})",
                columns.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationReport {
    pub table_name: String,
    pub total_rows: i64,
    pub threshold: f64,
    pub columns: Vec<ColumnCoverage>,
    pub referential_integrity_violations: i64,
    pub duplicate_groups: i64,
    pub findings: Vec<Finding>,
    pub generated_at: String,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

/// `populated / total * 100`; an empty table counts as fully covered.
pub fn coverage_pct(populated: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    populated as f64 / total as f64 * 100.0
}

pub fn coverage_status(pct: f64, threshold: f64) -> CoverageStatus {
    if pct >= threshold {
        CoverageStatus::Ok
    } else {
        CoverageStatus::AttentionNeeded
    }
}

pub struct Verifier {
    db: Database,
    threshold: f64,
}

impl Verifier {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            threshold: DEFAULT_COVERAGE_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Row count, per-column non-NULL counts and coverage against the
    /// verifier's threshold.
    pub async fn verify(&self, table: &str, columns: &[String]) -> DbResult<ReconciliationReport> {
        self.verify_with_threshold(table, columns, self.threshold).await
    }

    pub async fn verify_with_threshold(
        &self,
        table: &str,
        columns: &[String],
        threshold: f64,
    ) -> DbResult<ReconciliationReport> {
        self.require_columns(table, columns).await?;

        let mut select = vec!["COUNT(*)".to_string()];
        select.extend(columns.iter().map(|c| format!("COUNT({})", quote_ident(c))));
        let sql = format!("SELECT {} FROM {}", select.join(", "), quote_ident(table));
        let row = sqlx::query(&sql).fetch_one(self.db.pool()).await?;

        let total_rows: i64 = row.try_get(0)?;
        let mut coverage = Vec::with_capacity(columns.len());
        let mut findings = Vec::new();
        for (i, column) in columns.iter().enumerate() {
            let populated_rows: i64 = row.try_get(i + 1)?;
            let pct = coverage_pct(populated_rows, total_rows);
            let status = coverage_status(pct, threshold);
            if status == CoverageStatus::AttentionNeeded {
                warn!(table, column = %column, coverage_pct = pct, threshold, "coverage below threshold");
                findings.push(Finding::CoverageBelowThreshold {
                    table: table.to_string(),
                    column: column.clone(),
                    coverage_pct: pct,
                    threshold,
                });
            }
            coverage.push(ColumnCoverage {
                column: column.clone(),
                populated_rows,
                coverage_pct: pct,
                status,
            });
        }
        info!(table, total_rows, columns = columns.len(), "coverage computed");

        Ok(ReconciliationReport {
            table_name: table.to_string(),
            total_rows,
            threshold,
            columns: coverage,
            referential_integrity_violations: 0,
            duplicate_groups: 0,
            findings,
            generated_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Child rows with a non-NULL foreign key value and no matching parent.
    pub async fn verify_referential_integrity(
        &self,
        table: &str,
        fk: &ForeignKeyDef,
    ) -> DbResult<i64> {
        self.require_columns(table, std::slice::from_ref(&fk.column)).await?;
        self.require_columns(&fk.parent_table, std::slice::from_ref(&fk.parent_column))
            .await?;
        let sql = format!(
            "SELECT COUNT(*) FROM {child} AS c LEFT JOIN {parent} AS p ON c.{col} = p.{pcol} \
             WHERE c.{col} IS NOT NULL AND p.{pcol} IS NULL",
            child = quote_ident(table),
            parent = quote_ident(&fk.parent_table),
            col = quote_ident(&fk.column),
            pcol = quote_ident(&fk.parent_column),
        );
        let (violations,): (i64,) = sqlx::query_as(&sql).fetch_one(self.db.pool()).await?;
        if violations > 0 {
            warn!(
                table,
                column = %fk.column,
                parent_table = %fk.parent_table,
                violations,
                "orphaned rows found"
            );
        }
        Ok(violations)
    }

    /// Run the referential check for every foreign key the catalog declares
    /// on `table`.
    pub async fn verify_declared_foreign_keys(
        &self,
        table: &str,
    ) -> DbResult<Vec<(ForeignKeyDef, i64)>> {
        let mut conn = self.db.pool().acquire().await?;
        let declared = catalog::foreign_keys(&mut conn, table).await?;
        let mut defs = Vec::with_capacity(declared.len());
        for fk in declared {
            let parent_column = match fk.parent_column {
                Some(c) => c,
                None => catalog::columns(&mut conn, &fk.parent_table)
                    .await?
                    .into_iter()
                    .find(|c| c.primary_key)
                    .map(|c| c.name)
                    .unwrap_or_else(|| "rowid".to_string()),
            };
            defs.push(ForeignKeyDef {
                column: fk.column,
                parent_table: fk.parent_table,
                parent_column,
            });
        }
        drop(conn);

        let mut out = Vec::with_capacity(defs.len());
        for def in defs {
            let violations = self.verify_referential_integrity(table, &def).await?;
            out.push((def, violations));
        }
        Ok(out)
    }

    /// Number of distinct key values held by more than one row. Rows with a
    /// NULL in any key column are not compared.
    pub async fn verify_no_duplicates(&self, table: &str, key_columns: &[String]) -> DbResult<i64> {
        self.require_columns(table, key_columns).await?;
        if key_columns.is_empty() {
            return Ok(0);
        }
        let cols: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();
        let not_null: Vec<String> = cols.iter().map(|c| format!("{c} IS NOT NULL")).collect();
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1)",
            quote_ident(table),
            not_null.join(" AND "),
            cols.join(", ")
        );
        let (groups,): (i64,) = sqlx::query_as(&sql).fetch_one(self.db.pool()).await?;
        if groups > 0 {
            warn!(table, columns = %key_columns.join(","), groups, "duplicate keys found");
        }
        Ok(groups)
    }

    /// Every check a plan's `[[verifications]]` entry asks for, in one report.
    pub async fn run(&self, def: &VerificationDef) -> DbResult<ReconciliationReport> {
        let threshold = def.coverage_threshold.unwrap_or(self.threshold);
        let mut report = self
            .verify_with_threshold(&def.table, &def.columns, threshold)
            .await?;

        for fk in &def.foreign_keys {
            let violations = self.verify_referential_integrity(&def.table, fk).await?;
            report.referential_integrity_violations += violations;
            if violations > 0 {
                report.findings.push(Finding::ReferentialIntegrityViolation {
                    table: def.table.clone(),
                    column: fk.column.clone(),
                    parent_table: fk.parent_table.clone(),
                    parent_column: fk.parent_column.clone(),
                    violations,
                });
            }
        }

        for key in &def.unique_keys {
            let groups = self.verify_no_duplicates(&def.table, key).await?;
            report.duplicate_groups += groups;
            if groups > 0 {
                report.findings.push(Finding::DuplicateKeys {
                    table: def.table.clone(),
                    columns: key.clone(),
                    duplicate_groups: groups,
                });
            }
        }
        Ok(report)
    }

    /// A quoted name SQLite cannot resolve reads as a string literal, so
    /// every name is checked against the catalog first.
    async fn require_columns(&self, table: &str, columns: &[String]) -> DbResult<()> {
        let mut conn = self.db.pool().acquire().await?;
        if !catalog::table_exists(&mut conn, table).await? {
            return Err(DbError::MissingObject(format!("table {table}")));
        }
        let existing = catalog::columns(&mut conn, table).await?;
        for column in columns {
            let known = column.eq_ignore_ascii_case("rowid")
                || existing.iter().any(|c| c.name.eq_ignore_ascii_case(column));
            if !known {
                return Err(DbError::MissingObject(format!("column {table}.{column}")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_empty_table_is_fully_covered() {
        assert_eq!(coverage_pct(0, 0), 100.0);
        assert_eq!(coverage_status(coverage_pct(0, 0), 95.0), CoverageStatus::Ok);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        assert_eq!(coverage_status(95.0, 95.0), CoverageStatus::Ok);
        assert_eq!(coverage_status(94.99, 95.0), CoverageStatus::AttentionNeeded);
    }

    #[test]
    fn test_finding_display() {
        let f = Finding::CoverageBelowThreshold {
            table: "horses".into(),
            column: "sire_id".into(),
            coverage_pct: 93.456,
            threshold: 95.0,
        };
        assert_eq!(f.to_string(), "horses.sire_id coverage 93.46% is below 95.00%");
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&CoverageStatus::AttentionNeeded).unwrap();
        assert_eq!(json, "\"ATTENTION_NEEDED\"");
    }

    proptest! {
        #[test]
        fn prop_coverage_bounded(total in 1i64..1_000_000, frac in 0.0f64..=1.0) {
            let populated = (total as f64 * frac).floor() as i64;
            let pct = coverage_pct(populated, total);
            prop_assert!((0.0..=100.0).contains(&pct));
            prop_assert_eq!(pct == 100.0, populated == total);
        }

        #[test]
        fn prop_more_populated_never_lowers_coverage(total in 1i64..10_000, a in 0i64..10_000, b in 0i64..10_000) {
            let (lo, hi) = (a.min(b).min(total), a.max(b).min(total));
            prop_assert!(coverage_pct(lo, total) <= coverage_pct(hi, total));
        }
    }
}
