// crates/jobs/src/state.rs
//! Atomic state tracking for a single job.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;
use tokio::sync::broadcast;

use super::types::{JobId, JobProgress, JobStatus};

/// Atomic state for a single job.
///
/// All fields use lock-free atomics (except `message` which uses a RwLock)
/// so progress updates from the batch loop never block readers.
pub struct JobState {
    id: JobId,
    job_type: String,
    status: AtomicU8,
    current: AtomicU64,
    total: AtomicU64,
    message: RwLock<Option<String>>,
    progress_tx: broadcast::Sender<JobProgress>,
}

impl JobState {
    /// Create a new job state with the given ID, label, and total count.
    pub fn new(id: JobId, job_type: String, total: u64) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            id,
            job_type,
            status: AtomicU8::new(JobStatus::Created as u8),
            current: AtomicU64::new(0),
            total: AtomicU64::new(total),
            message: RwLock::new(None),
            progress_tx,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Transition the job to Running status.
    pub fn set_running(&self) {
        self.set_status(JobStatus::Running);
    }

    /// Add `n` to the progress counter and broadcast. Returns the new value.
    pub fn advance(&self, n: u64) -> u64 {
        let new = self.current.fetch_add(n, Ordering::Relaxed) + n;
        self.broadcast_progress();
        new
    }

    /// Overwrite the progress counter (used when resuming from a checkpoint).
    pub fn set_current(&self, current: u64) {
        self.current.store(current, Ordering::Relaxed);
        self.broadcast_progress();
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
        self.broadcast_progress();
    }

    /// Set the human-readable progress message and broadcast.
    pub fn set_message(&self, msg: impl Into<String>) {
        match self.message.write() {
            Ok(mut guard) => *guard = Some(msg.into()),
            Err(e) => tracing::error!("RwLock poisoned writing message: {e}"),
        }
        self.broadcast_progress();
    }

    /// Mark the job as completed.
    pub fn complete(&self) {
        self.set_status(JobStatus::Completed);
    }

    /// Mark the job as paused (cancelled at a batch boundary).
    pub fn pause(&self) {
        self.set_status(JobStatus::Paused);
    }

    /// Mark the job as failed with an error message.
    pub fn fail(&self, error: impl Into<String>) {
        self.status.store(JobStatus::Failed as u8, Ordering::Relaxed);
        match self.message.write() {
            Ok(mut guard) => *guard = Some(error.into()),
            Err(e) => tracing::error!("RwLock poisoned writing error message: {e}"),
        }
        self.broadcast_progress();
    }

    /// Subscribe to progress updates for this specific job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgress> {
        self.progress_tx.subscribe()
    }

    /// Get a snapshot of the current job state.
    pub fn snapshot(&self) -> JobProgress {
        JobProgress {
            job_id: self.id,
            job_type: self.job_type.clone(),
            status: self.status(),
            current: self.current.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            message: match self.message.read() {
                Ok(g) => g.clone(),
                Err(e) => {
                    tracing::error!("RwLock poisoned reading message: {e}");
                    None
                }
            },
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
        self.broadcast_progress();
    }

    fn broadcast_progress(&self) {
        let progress = self.snapshot();
        // Ignore send errors (no subscribers is fine).
        let _ = self.progress_tx.send(progress);
    }
}
