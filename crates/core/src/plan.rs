// crates/core/src/plan.rs
//! Declarative plan file: schema migrations, backfill jobs and verification
//! targets.
//!
//! The plan is the only place a schema change is written down. The executor
//! compares it against the ledger; the checksum of each migration's content is
//! what detects drift between "what was applied" and "what the file says now".

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PlanError;

pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Parsed plan file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub migrations: Vec<MigrationDef>,
    #[serde(default)]
    pub backfills: Vec<BackfillDef>,
    #[serde(default)]
    pub verifications: Vec<VerificationDef>,
}

/// One versioned schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDef {
    pub version: i64,
    pub description: String,
    pub steps: Vec<Step>,
}

/// Column declaration used by `create_table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// SQL literal, inserted verbatim after `DEFAULT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignRef {
    pub table: String,
    pub column: String,
}

/// A single idempotent schema operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    CreateTable {
        table: String,
        columns: Vec<ColumnDef>,
    },
    AddColumn {
        table: String,
        column: String,
        data_type: String,
        #[serde(default = "default_true")]
        nullable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    RenameColumn {
        table: String,
        from: String,
        to: String,
    },
    RenameTable {
        from: String,
        to: String,
    },
    DropColumn {
        table: String,
        column: String,
        #[serde(default)]
        require_empty: bool,
    },
    DropTable {
        table: String,
        #[serde(default)]
        require_empty: bool,
    },
    AddIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        #[serde(default)]
        unique: bool,
        /// Optional indexes that fail to build are reported, not fatal.
        #[serde(default)]
        optional: bool,
    },
}

/// Kind of catalog object a step touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    Column,
    Index,
}

/// Reference to a catalog object by qualified name (`table` or `table.column`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: ObjectType,
    pub qualified_name: String,
}

impl ObjectRef {
    fn table(name: &str) -> Self {
        Self {
            object_type: ObjectType::Table,
            qualified_name: name.to_string(),
        }
    }

    fn column(table: &str, column: &str) -> Self {
        Self {
            object_type: ObjectType::Column,
            qualified_name: format!("{table}.{column}"),
        }
    }

    fn index(name: &str) -> Self {
        Self {
            object_type: ObjectType::Index,
            qualified_name: name.to_string(),
        }
    }
}

impl Step {
    /// Short human-readable label used in logs and summaries.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { table, columns } => {
                format!("create table {table} ({} columns)", columns.len())
            }
            Self::AddColumn {
                table,
                column,
                data_type,
                ..
            } => format!("add column {table}.{column} {data_type}"),
            Self::RenameColumn { table, from, to } => {
                format!("rename column {table}.{from} -> {to}")
            }
            Self::RenameTable { from, to } => format!("rename table {from} -> {to}"),
            Self::DropColumn { table, column, .. } => format!("drop column {table}.{column}"),
            Self::DropTable { table, .. } => format!("drop table {table}"),
            Self::AddIndex {
                name,
                table,
                columns,
                ..
            } => format!("add index {name} on {table}({})", columns.join(", ")),
        }
    }

    /// Catalog objects this step creates, renames or removes.
    pub fn touched_objects(&self) -> Vec<ObjectRef> {
        match self {
            Self::CreateTable { table, .. } | Self::DropTable { table, .. } => {
                vec![ObjectRef::table(table)]
            }
            Self::AddColumn { table, column, .. } | Self::DropColumn { table, column, .. } => {
                vec![ObjectRef::column(table, column)]
            }
            Self::RenameColumn { table, from, to } => {
                vec![ObjectRef::column(table, from), ObjectRef::column(table, to)]
            }
            Self::RenameTable { from, to } => vec![ObjectRef::table(from), ObjectRef::table(to)],
            Self::AddIndex { name, .. } => vec![ObjectRef::index(name)],
        }
    }

    fn identifiers(&self) -> Vec<&str> {
        match self {
            Self::CreateTable { table, columns } => {
                let mut ids = vec![table.as_str()];
                for c in columns {
                    ids.push(c.name.as_str());
                    if let Some(r) = &c.references {
                        ids.push(r.table.as_str());
                        ids.push(r.column.as_str());
                    }
                }
                ids
            }
            Self::AddColumn { table, column, .. } | Self::DropColumn { table, column, .. } => {
                vec![table.as_str(), column.as_str()]
            }
            Self::RenameColumn { table, from, to } => {
                vec![table.as_str(), from.as_str(), to.as_str()]
            }
            Self::RenameTable { from, to } => vec![from.as_str(), to.as_str()],
            Self::DropTable { table, .. } => vec![table.as_str()],
            Self::AddIndex {
                name,
                table,
                columns,
                ..
            } => {
                let mut ids = vec![name.as_str(), table.as_str()];
                ids.extend(columns.iter().map(String::as_str));
                ids
            }
        }
    }

    fn validate(&self) -> Result<(), PlanError> {
        for ident in self.identifiers() {
            validate_ident(ident)?;
        }
        match self {
            Self::CreateTable { table, columns } => {
                if columns.is_empty() {
                    return Err(PlanError::Invalid(format!("create_table {table} has no columns")));
                }
                for c in columns {
                    validate_fragment(&c.data_type)?;
                    if let Some(d) = &c.default {
                        validate_fragment(d)?;
                    }
                }
            }
            Self::AddColumn {
                table,
                column,
                data_type,
                nullable,
                default,
            } => {
                if !nullable && default.is_none() {
                    return Err(PlanError::Invalid(format!(
                        "add_column {table}.{column} is NOT NULL without a default"
                    )));
                }
                validate_fragment(data_type)?;
                if let Some(d) = default {
                    validate_fragment(d)?;
                }
            }
            Self::RenameColumn { from, to, .. } | Self::RenameTable { from, to } if from == to => {
                return Err(PlanError::Invalid(format!("rename of {from} onto itself")));
            }
            Self::AddIndex { name, columns, .. } if columns.is_empty() => {
                return Err(PlanError::Invalid(format!("index {name} has no columns")));
            }
            _ => {}
        }
        Ok(())
    }
}

impl MigrationDef {
    /// SHA-256 (hex) over the canonical JSON of description + steps.
    pub fn checksum(&self) -> String {
        let canonical = serde_json::json!({
            "description": self.description,
            "steps": self.steps,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// How rows of a backfill get their new values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformDef {
    /// `column = <sql expression over the row>`, evaluated by the database.
    Expression { assignments: BTreeMap<String, String> },
    /// `column = record[field]` where the record is fetched from the racing API
    /// by the value of `id_column`.
    Upstream {
        entity: String,
        id_column: String,
        fields: BTreeMap<String, String>,
    },
}

/// A resumable population pass over one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillDef {
    pub job_id: String,
    pub table: String,
    #[serde(default = "default_key_column")]
    pub key_column: String,
    pub columns: Vec<String>,
    /// SQL condition selecting rows that still need work.
    pub predicate: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    pub transform: TransformDef,
}

impl BackfillDef {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.job_id.trim().is_empty() {
            return Err(PlanError::Invalid("backfill with empty job_id".into()));
        }
        validate_ident(&self.table)?;
        validate_ident(&self.key_column)?;
        if self.columns.is_empty() {
            return Err(PlanError::Invalid(format!(
                "backfill {} has no target columns",
                self.job_id
            )));
        }
        for c in &self.columns {
            validate_ident(c)?;
        }
        validate_fragment(&self.predicate)?;
        if self.batch_size == 0 {
            return Err(PlanError::Invalid(format!(
                "backfill {} has batch_size 0",
                self.job_id
            )));
        }
        let assigned: Vec<&String> = match &self.transform {
            TransformDef::Expression { assignments } => {
                for expr in assignments.values() {
                    validate_fragment(expr)?;
                }
                assignments.keys().collect()
            }
            TransformDef::Upstream {
                entity,
                id_column,
                fields,
            } => {
                validate_ident(id_column)?;
                if entity.is_empty() || entity.contains('/') {
                    return Err(PlanError::Invalid(format!("bad upstream entity {entity:?}")));
                }
                fields.keys().collect()
            }
        };
        if assigned.is_empty() {
            return Err(PlanError::Invalid(format!(
                "backfill {} transform assigns nothing",
                self.job_id
            )));
        }
        for col in assigned {
            if !self.columns.contains(col) {
                return Err(PlanError::Invalid(format!(
                    "backfill {} assigns {col}, which is not a target column",
                    self.job_id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyDef {
    pub column: String,
    pub parent_table: String,
    pub parent_column: String,
}

/// Post-condition checks for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDef {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_threshold: Option<f64>,
    #[serde(default)]
    pub unique_keys: Vec<Vec<String>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKeyDef>,
}

impl Plan {
    /// Read and validate a plan file.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|e| PlanError::io(path, e))?;
        let plan: Plan = toml::from_str(&text).map_err(|e| PlanError::Malformed {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parse from a string (tests, embedded plans).
    pub fn from_toml_str(text: &str) -> Result<Self, PlanError> {
        let plan: Plan = toml::from_str(text).map_err(|e| PlanError::Malformed {
            path: "<inline>".into(),
            message: e.to_string(),
        })?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let mut previous: Option<i64> = None;
        let mut seen = HashSet::new();
        for m in &self.migrations {
            if m.version < 1 {
                return Err(PlanError::Invalid(format!(
                    "migration version {} is reserved (versions start at 1)",
                    m.version
                )));
            }
            if !seen.insert(m.version) {
                return Err(PlanError::DuplicateVersion { version: m.version });
            }
            if let Some(prev) = previous {
                if m.version <= prev {
                    return Err(PlanError::VersionOrder {
                        previous: prev,
                        version: m.version,
                    });
                }
            }
            previous = Some(m.version);
            if m.steps.is_empty() {
                return Err(PlanError::EmptyMigration { version: m.version });
            }
            for step in &m.steps {
                step.validate()?;
            }
        }

        let mut job_ids = HashSet::new();
        for b in &self.backfills {
            b.validate()?;
            if !job_ids.insert(b.job_id.as_str()) {
                return Err(PlanError::Invalid(format!("duplicate backfill job_id {}", b.job_id)));
            }
        }

        for v in &self.verifications {
            validate_ident(&v.table)?;
            for c in v.columns.iter().chain(v.unique_keys.iter().flatten()) {
                validate_ident(c)?;
            }
            for fk in &v.foreign_keys {
                validate_ident(&fk.column)?;
                validate_ident(&fk.parent_table)?;
                validate_ident(&fk.parent_column)?;
            }
            if let Some(t) = v.coverage_threshold {
                if !(0.0..=100.0).contains(&t) {
                    return Err(PlanError::Invalid(format!(
                        "coverage_threshold {t} for {} outside 0..=100",
                        v.table
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn backfill(&self, job_id: &str) -> Option<&BackfillDef> {
        self.backfills.iter().find(|b| b.job_id == job_id)
    }
}

/// Identifiers are interpolated into DDL, so only plain names are accepted.
pub fn validate_ident(ident: &str) -> Result<(), PlanError> {
    let mut chars = ident.chars();
    let ok = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(PlanError::InvalidIdentifier {
            ident: ident.to_string(),
        })
    }
}

/// SQL fragments (types, defaults, predicates) must be a single expression.
fn validate_fragment(fragment: &str) -> Result<(), PlanError> {
    if fragment.trim().is_empty() || fragment.contains(';') || fragment.contains("--") {
        return Err(PlanError::Invalid(format!("rejected SQL fragment {fragment:?}")));
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn default_key_column() -> String {
    "id".to_string()
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PLAN: &str = r#"
[[migrations]]
version = 1
description = "create horses"
[[migrations.steps]]
op = "create_table"
table = "horses"
columns = [
  { name = "id", data_type = "INTEGER", primary_key = true },
  { name = "api_id", data_type = "TEXT", nullable = false },
  { name = "age", data_type = "INTEGER" },
]

[[migrations]]
version = 2
description = "colour code"
[[migrations.steps]]
op = "add_column"
table = "horses"
column = "colour_code"
data_type = "VARCHAR(10)"

[[migrations.steps]]
op = "add_index"
name = "idx_horses_colour_code"
table = "horses"
columns = ["colour_code"]
optional = true

[[backfills]]
job_id = "horses-pedigree"
table = "horses"
columns = ["sire_id"]
predicate = "sire_id IS NULL"
transform = { kind = "upstream", entity = "horses", id_column = "api_id", fields = { sire_id = "sire_id" } }

[[verifications]]
table = "horses"
columns = ["sire_id"]
coverage_threshold = 96.0
unique_keys = [["api_id"]]
"#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::from_toml_str(PLAN).expect("plan should parse");
        assert_eq!(plan.migrations.len(), 2);
        assert_eq!(plan.migrations[1].steps.len(), 2);
        match &plan.migrations[1].steps[0] {
            Step::AddColumn {
                column, nullable, ..
            } => {
                assert_eq!(column, "colour_code");
                assert!(*nullable, "nullable defaults to true");
            }
            other => panic!("unexpected step {other:?}"),
        }
        let bf = plan.backfill("horses-pedigree").unwrap();
        assert_eq!(bf.key_column, "id");
        assert_eq!(bf.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(plan.verifications[0].coverage_threshold, Some(96.0));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let plan = Plan::from_toml_str(PLAN).unwrap();
        let a = plan.migrations[1].checksum();
        assert_eq!(a.len(), 64);
        assert_eq!(a, plan.migrations[1].checksum(), "checksum is deterministic");

        let mut edited = plan.migrations[1].clone();
        edited.description = "colour code (edited)".into();
        assert_ne!(a, edited.checksum());
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let text = r#"
[[migrations]]
version = 18
description = "a"
steps = [{ op = "drop_table", table = "a" }]
[[migrations]]
version = 18
description = "b"
steps = [{ op = "drop_table", table = "b" }]
"#;
        let err = Plan::from_toml_str(text).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateVersion { version: 18 }));
    }

    #[test]
    fn test_out_of_order_versions_rejected() {
        let text = r#"
[[migrations]]
version = 3
description = "a"
steps = [{ op = "drop_table", table = "a" }]
[[migrations]]
version = 2
description = "b"
steps = [{ op = "drop_table", table = "b" }]
"#;
        let err = Plan::from_toml_str(text).unwrap_err();
        assert!(matches!(
            err,
            PlanError::VersionOrder {
                previous: 3,
                version: 2
            }
        ));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_ident("horse_age").is_ok());
        assert!(validate_ident("_tmp1").is_ok());
        assert!(validate_ident("1abc").is_err());
        assert!(validate_ident("horses; DROP TABLE x").is_err());
        assert!(validate_ident("").is_err());
    }

    #[test]
    fn test_backfill_must_assign_target_columns() {
        let text = r#"
[[backfills]]
job_id = "x"
table = "horses"
columns = ["sire_id"]
predicate = "sire_id IS NULL"
transform = { kind = "expression", assignments = { dam_id = "1" } }
"#;
        let err = Plan::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("not a target column"));
    }

    #[test]
    fn test_statement_smuggling_rejected() {
        let text = r#"
[[backfills]]
job_id = "x"
table = "horses"
columns = ["sire_id"]
predicate = "1=1; DELETE FROM horses"
transform = { kind = "expression", assignments = { sire_id = "1" } }
"#;
        assert!(Plan::from_toml_str(text).is_err());
    }

    #[test]
    fn test_not_null_column_needs_default() {
        let text = r#"
[[migrations]]
version = 4
description = "finishing position"
steps = [{ op = "add_column", table = "results", column = "position", data_type = "INTEGER", nullable = false }]
"#;
        let err = Plan::from_toml_str(text).unwrap_err();
        assert!(err.to_string().contains("without a default"));
    }

    #[test]
    fn test_touched_objects() {
        let step = Step::RenameColumn {
            table: "horses".into(),
            from: "age".into(),
            to: "horse_age".into(),
        };
        let objs = step.touched_objects();
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[1].qualified_name, "horses.horse_age");
        assert_eq!(objs[1].object_type, ObjectType::Column);
    }
}
