// crates/core/src/upstream/factory.rs
//! Source factory: creates an UpstreamSource from configuration.

use std::sync::Arc;

use super::http::HttpUpstream;
use super::source::UpstreamSource;
use super::types::UpstreamError;
use crate::config::UpstreamConfig;

/// Create the racing API client described by `config`.
///
/// Only expression backfills can run without a configured `base_url`.
pub fn create_source(config: &UpstreamConfig) -> Result<Arc<dyn UpstreamSource>, UpstreamError> {
    let base_url = config.base_url.as_deref().ok_or_else(|| {
        UpstreamError::NotConfigured(
            "upstream.base_url (or DARKHORSES_API_URL) is required for upstream backfills".into(),
        )
    })?;
    let source = HttpUpstream::new(
        base_url,
        config.api_key.clone(),
        std::time::Duration::from_secs(config.timeout_secs),
    )?;
    Ok(Arc::new(source))
}
