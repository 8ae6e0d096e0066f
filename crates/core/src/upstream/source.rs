// crates/core/src/upstream/source.rs
//! UpstreamSource trait defining the interface to the racing data API.

use async_trait::async_trait;

use super::types::{FetchOutcome, UpstreamError};

/// Capability to look up a single entity by id.
///
/// Implementations include:
/// - `HttpUpstream`: REST calls against the racing API
/// - in-test fakes that count calls and inject rate limits
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetch one entity (`entity` is the collection, e.g. `"horses"`).
    ///
    /// `Ok(NotFound)` means "leave the row unpopulated", while
    /// `Err(RateLimited)` asks the caller to back off and retry.
    async fn fetch_entity(&self, entity: &str, id: &str) -> Result<FetchOutcome, UpstreamError>;

    /// Source name for logging.
    fn name(&self) -> &str;
}
