// crates/core/src/upstream/mod.rs
//! Racing data API integration.
//!
//! Backfills that need data the warehouse does not hold yet (pedigrees,
//! colour codes) fetch it one entity at a time through `UpstreamSource`.

pub mod factory;
pub mod http;
pub mod source;
pub mod types;

pub use factory::create_source;
pub use http::HttpUpstream;
pub use source::UpstreamSource;
pub use types::{FetchOutcome, UpstreamError, UpstreamRecord};
