// crates/jobs/src/lib.rs
//! In-process job tracking for long-running backfills.
//!
//! Provides:
//! - `JobRegistry`: central manager for spawning and tracking jobs
//! - `JobState`: atomic progress tracking per job
//! - `JobHandle`: cooperative cancellation + join handle
//! - `JobProgress`: progress snapshots for the CLI progress bar
//! - `JobStatus`: lifecycle shared with the persisted backfill job row

pub mod registry;
pub mod state;
pub mod types;

pub use registry::JobRegistry;
pub use state::JobState;
pub use types::{JobHandle, JobId, JobProgress, JobStatus};
