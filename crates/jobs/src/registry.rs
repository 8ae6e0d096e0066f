// crates/jobs/src/registry.rs
//! Central registry that spawns and tracks jobs running in this process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::state::JobState;
use super::types::{JobHandle, JobId, JobProgress, JobStatus};

/// Central job registry.
///
/// Call `start_job` to spawn async work with progress tracking, and
/// `subscribe` to get progress updates across all jobs. Every job gets a
/// child of the registry's root cancellation token, so `cancel_all` (wired
/// to ctrl-c in the CLI) pauses everything at the next batch boundary.
pub struct JobRegistry {
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, Arc<JobState>>>,
    global_tx: broadcast::Sender<JobProgress>,
    root_cancel: CancellationToken,
}

impl JobRegistry {
    pub fn new() -> Self {
        let (global_tx, _) = broadcast::channel(256);
        Self {
            next_id: AtomicU64::new(1),
            jobs: RwLock::new(HashMap::new()),
            global_tx,
            root_cancel: CancellationToken::new(),
        }
    }

    /// Start a new job.
    ///
    /// The closure `f` receives:
    /// - `Arc<JobState>` for reporting progress
    /// - `CancellationToken` to poll between batches
    ///
    /// It resolves to the status the job stopped in (`Completed` or
    /// `Paused`), or an error message which marks the job failed.
    pub fn start_job<F, Fut>(&self, job_type: impl Into<String>, total: u64, f: F) -> JobHandle
    where
        F: FnOnce(Arc<JobState>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<JobStatus, String>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(JobState::new(id, job_type.into(), total));

        match self.jobs.write() {
            Ok(mut jobs) => {
                jobs.insert(id, Arc::clone(&state));
            }
            Err(e) => tracing::error!("RwLock poisoned writing jobs map: {e}"),
        }

        let cancel = self.root_cancel.child_token();

        // Forward job progress to global channel
        let global_tx = self.global_tx.clone();
        let mut rx = state.subscribe();
        tokio::spawn(async move {
            while let Ok(progress) = rx.recv().await {
                let _ = global_tx.send(progress);
            }
        });

        let state_for_task = Arc::clone(&state);
        let cancel_for_task = cancel.clone();
        let task = tokio::spawn(async move {
            state_for_task.set_running();
            match f(state_for_task.clone(), cancel_for_task).await {
                Ok(JobStatus::Paused) => state_for_task.pause(),
                Ok(_) => state_for_task.complete(),
                Err(e) => state_for_task.fail(e),
            }
        });

        JobHandle::new(id, cancel, task)
    }

    /// Subscribe to all job progress updates.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgress> {
        self.global_tx.subscribe()
    }

    /// Get current status of a specific job.
    pub fn get_job(&self, id: JobId) -> Option<JobProgress> {
        match self.jobs.read() {
            Ok(jobs) => jobs.get(&id).map(|s| s.snapshot()),
            Err(e) => {
                tracing::error!("RwLock poisoned reading jobs map: {e}");
                None
            }
        }
    }

    /// Get all jobs that are still executing.
    pub fn active_jobs(&self) -> Vec<JobProgress> {
        match self.jobs.read() {
            Ok(jobs) => jobs
                .values()
                .map(|s| s.snapshot())
                .filter(|p| !p.status.is_stopped())
                .collect(),
            Err(e) => {
                tracing::error!("RwLock poisoned reading jobs: {e}");
                Vec::new()
            }
        }
    }

    /// Request a cooperative stop of every job.
    pub fn cancel_all(&self) {
        self.root_cancel.cancel();
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
