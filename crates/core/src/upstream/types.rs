// crates/core/src/upstream/types.rs
//! Response/error types for the racing data API.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

/// One entity as returned by the API: a flat JSON object.
pub type UpstreamRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(UpstreamRecord),
    NotFound,
}

impl FetchOutcome {
    /// Value of `field`, with JSON `null` treated as absent.
    pub fn field(&self, field: &str) -> Option<&Value> {
        match self {
            Self::Found(record) => record.get(field).filter(|v| !v.is_null()),
            Self::NotFound => None,
        }
    }
}

/// Errors that can occur while talking to the racing API.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to decode upstream response: {0}")]
    Decode(String),

    #[error("Upstream not configured: {0}")]
    NotConfigured(String),
}

impl UpstreamError {
    /// Rate limits and timeouts are retried by the backfill runner.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout(_))
    }
}
