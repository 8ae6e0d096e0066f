// crates/db/src/backfill/cursor.rs
//! Checkpoint cursor over a backfill's ordering key.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

/// Value of the ordering key of the last row a committed batch covered.
///
/// Ordered the way SQLite compares stored values: every integer sorts before
/// every text value, text compares bytewise (BINARY collation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum CursorKey {
    Int(i64),
    Text(String),
}

impl CursorKey {
    /// Value stored in `_backfill_jobs.checkpoint_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Text(_) => "text",
        }
    }

    /// Value stored in `_backfill_jobs.checkpoint_cursor`.
    pub fn encode(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Text(s) => s.clone(),
        }
    }

    pub fn decode(kind: &str, raw: &str) -> Option<Self> {
        match kind {
            "int" => raw.parse().ok().map(Self::Int),
            "text" => Some(Self::Text(raw.to_string())),
            _ => None,
        }
    }

    /// Build from `typeof(key)` and `CAST(key AS TEXT)`. Only integer and
    /// text keys have a stable order we can checkpoint.
    pub(crate) fn from_sql(type_name: &str, text: String) -> Option<Self> {
        match type_name {
            "integer" => text.parse().ok().map(Self::Int),
            "text" => Some(Self::Text(text)),
            _ => None,
        }
    }
}

impl Ord for CursorKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Self::Int(_), Self::Text(_)) => Ordering::Less,
            (Self::Text(_), Self::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for CursorKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CursorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}
