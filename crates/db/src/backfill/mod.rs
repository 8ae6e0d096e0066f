// crates/db/src/backfill/mod.rs
//! Resumable, checkpointed backfill jobs.
//!
//! - `store`: `_backfill_jobs` rows with compare-and-swap updates
//! - `lease`: cross-process lock per `(table, column)`
//! - `transform`: how new values are computed (SQL expression or racing API)
//! - `runner`: the batch loop: pacing, backoff, adaptive batch size

mod cursor;
mod lease;
mod runner;
mod store;
mod transform;

pub use cursor::CursorKey;
pub use lease::{lock_key, lock_keys, Lease};
pub use runner::{BackfillRunner, BatchResult, SpawnedBackfill};
pub use store::{can_transition, BackfillJob};
pub use transform::{
    build_transform, ExpressionTransform, RowPatch, RowTransform, SourceRow, TransformError,
    UpstreamTransform,
};
