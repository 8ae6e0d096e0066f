// crates/db/src/backfill/transform.rs
//! Row transforms: how a backfill computes the new values of one row.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use darkhorses_core::upstream::{FetchOutcome, UpstreamError, UpstreamSource};
use darkhorses_core::{RequestPacer, TransformDef};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::cursor::CursorKey;
use crate::quote_ident;

/// One row selected by a batch: its ordering key and `rowid` plus the values
/// of the transform's declared inputs, keyed by alias.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub key: CursorKey,
    pub rowid: i64,
    pub values: Map<String, Value>,
}

/// New non-NULL values for target columns.
pub type RowPatch = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("{0}")]
    Invalid(String),
}

impl From<UpstreamError> for TransformError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            UpstreamError::Timeout(after) => Self::Timeout(after),
            other => Self::Upstream(other),
        }
    }
}

/// Strategy for populating rows.
///
/// Implementations must be idempotent per row: applying to a row that is
/// already populated yields the same values (and the runner's UPDATE
/// re-checks the job predicate anyway).
#[async_trait]
pub trait RowTransform: Send + Sync {
    /// SQL expressions selected alongside the key, as `(alias, expression)`.
    fn inputs(&self) -> Vec<(String, String)>;

    /// Values for this row, or `None` when it cannot be populated (the row
    /// is skipped and left for the verifier to report).
    async fn apply(&self, row: &SourceRow) -> Result<Option<RowPatch>, TransformError>;

    fn name(&self) -> &str;
}

/// `column = <sql expression>`, evaluated by SQLite in the batch SELECT.
pub struct ExpressionTransform {
    assignments: BTreeMap<String, String>,
}

impl ExpressionTransform {
    pub fn new(assignments: BTreeMap<String, String>) -> Self {
        Self { assignments }
    }

    fn alias(column: &str) -> String {
        format!("__dh_new_{column}")
    }
}

#[async_trait]
impl RowTransform for ExpressionTransform {
    fn inputs(&self) -> Vec<(String, String)> {
        self.assignments
            .iter()
            .map(|(col, expr)| (Self::alias(col), expr.clone()))
            .collect()
    }

    async fn apply(&self, row: &SourceRow) -> Result<Option<RowPatch>, TransformError> {
        let patch: RowPatch = self
            .assignments
            .keys()
            .filter_map(|col| {
                row.values
                    .get(&Self::alias(col))
                    .filter(|v| !v.is_null())
                    .map(|v| (col.clone(), v.clone()))
            })
            .collect();
        Ok((!patch.is_empty()).then_some(patch))
    }

    fn name(&self) -> &str {
        "expression"
    }
}

/// `column = record[field]` for the record fetched from the racing API by
/// the row's `id_column` value.
pub struct UpstreamTransform {
    source: Arc<dyn UpstreamSource>,
    pacer: Arc<RequestPacer>,
    entity: String,
    id_column: String,
    fields: BTreeMap<String, String>,
}

const ID_ALIAS: &str = "__dh_upstream_id";

impl UpstreamTransform {
    pub fn new(
        source: Arc<dyn UpstreamSource>,
        pacer: Arc<RequestPacer>,
        entity: impl Into<String>,
        id_column: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            source,
            pacer,
            entity: entity.into(),
            id_column: id_column.into(),
            fields,
        }
    }
}

#[async_trait]
impl RowTransform for UpstreamTransform {
    fn inputs(&self) -> Vec<(String, String)> {
        vec![(ID_ALIAS.to_string(), quote_ident(&self.id_column))]
    }

    async fn apply(&self, row: &SourceRow) -> Result<Option<RowPatch>, TransformError> {
        let id = match row.values.get(ID_ALIAS) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(TransformError::Invalid(format!(
                    "{} of row {} is not a usable id: {other}",
                    self.id_column, row.key
                )))
            }
        };

        self.pacer.acquire().await;
        let outcome = self.source.fetch_entity(&self.entity, &id).await?;
        if outcome == FetchOutcome::NotFound {
            debug!(entity = %self.entity, %id, "upstream record not found");
            return Ok(None);
        }

        let patch: RowPatch = self
            .fields
            .iter()
            .filter_map(|(col, field)| outcome.field(field).map(|v| (col.clone(), v.clone())))
            .collect();
        Ok((!patch.is_empty()).then_some(patch))
    }

    fn name(&self) -> &str {
        self.source.name()
    }
}

/// Build the transform a plan entry describes.
///
/// `source` is only needed for upstream transforms.
pub fn build_transform(
    def: &TransformDef,
    source: Option<Arc<dyn UpstreamSource>>,
    pacer: Arc<RequestPacer>,
) -> Result<Arc<dyn RowTransform>, UpstreamError> {
    match def {
        TransformDef::Expression { assignments } => {
            Ok(Arc::new(ExpressionTransform::new(assignments.clone())))
        }
        TransformDef::Upstream {
            entity,
            id_column,
            fields,
        } => {
            let source = source.ok_or_else(|| {
                UpstreamError::NotConfigured(format!("backfill needs the {entity} API"))
            })?;
            Ok(Arc::new(UpstreamTransform::new(
                source,
                pacer,
                entity.clone(),
                id_column.clone(),
                fields.clone(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedSource {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpstreamSource for FixedSource {
        async fn fetch_entity(&self, _entity: &str, id: &str) -> Result<FetchOutcome, UpstreamError> {
            self.calls.lock().unwrap().push(id.to_string());
            match id {
                "h1" => Ok(FetchOutcome::Found(
                    json!({ "sire": 7, "dam": null }).as_object().unwrap().clone(),
                )),
                "busy" => Err(UpstreamError::RateLimited {
                    retry_after: Some(Duration::from_secs(1)),
                }),
                "slow" => Err(UpstreamError::Timeout(Duration::from_secs(30))),
                _ => Ok(FetchOutcome::NotFound),
            }
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn row(id: Value) -> SourceRow {
        let mut values = Map::new();
        values.insert(ID_ALIAS.into(), id);
        SourceRow {
            key: CursorKey::Int(1),
            rowid: 1,
            values,
        }
    }

    fn upstream() -> (Arc<FixedSource>, UpstreamTransform) {
        let source = Arc::new(FixedSource {
            calls: Mutex::new(Vec::new()),
        });
        let fields = BTreeMap::from([
            ("sire_id".to_string(), "sire".to_string()),
            ("dam_id".to_string(), "dam".to_string()),
        ]);
        let t = UpstreamTransform::new(
            source.clone(),
            Arc::new(RequestPacer::unlimited()),
            "horses",
            "api_id",
            fields,
        );
        (source, t)
    }

    #[tokio::test]
    async fn test_upstream_maps_fields_and_skips_nulls() {
        let (_, t) = upstream();
        let patch = t.apply(&row(json!("h1"))).await.unwrap().unwrap();
        assert_eq!(patch.get("sire_id"), Some(&json!(7)));
        assert!(!patch.contains_key("dam_id"));
    }

    #[tokio::test]
    async fn test_upstream_not_found_and_null_id_skip() {
        let (source, t) = upstream();
        assert_eq!(t.apply(&row(json!("missing"))).await.unwrap(), None);
        assert_eq!(t.apply(&row(Value::Null)).await.unwrap(), None);
        assert_eq!(source.calls.lock().unwrap().len(), 1, "NULL id makes no call");
    }

    #[tokio::test]
    async fn test_upstream_rate_limit_surfaces() {
        let (_, t) = upstream();
        let err = t.apply(&row(json!("busy"))).await.unwrap_err();
        assert!(matches!(err, TransformError::RateLimited { retry_after: Some(_) }));
    }

    #[tokio::test]
    async fn test_upstream_timeout_is_retryable() {
        let (_, t) = upstream();
        let err = t.apply(&row(json!("slow"))).await.unwrap_err();
        assert!(matches!(err, TransformError::Timeout(d) if d == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_expression_patch() {
        let t = ExpressionTransform::new(BTreeMap::from([
            ("horse_age".to_string(), "age".to_string()),
            ("age_band".to_string(), "NULL".to_string()),
        ]));
        assert_eq!(t.inputs().len(), 2);

        let mut values = Map::new();
        values.insert(ExpressionTransform::alias("horse_age"), json!(4));
        values.insert(ExpressionTransform::alias("age_band"), Value::Null);
        let patch = t
            .apply(&SourceRow {
                key: CursorKey::Int(1),
                rowid: 1,
                values,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(patch.len(), 1);
        assert_eq!(patch["horse_age"], json!(4));
    }

    #[test]
    fn test_build_upstream_without_source() {
        let def = TransformDef::Upstream {
            entity: "horses".into(),
            id_column: "api_id".into(),
            fields: BTreeMap::new(),
        };
        let err = build_transform(&def, None, Arc::new(RequestPacer::unlimited())).err().unwrap();
        assert!(matches!(err, UpstreamError::NotConfigured(_)));
    }
}
