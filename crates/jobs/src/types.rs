// crates/jobs/src/types.rs
//! Types for the job system.

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registry-local identifier for a running job.
pub type JobId = u64;

/// Lifecycle of a backfill job.
///
/// `Created -> Running -> (Completed | Paused | Failed)`; `Paused` and
/// `Failed` jobs go back to `Running` when resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created = 0,
    Running = 1,
    Paused = 2,
    Completed = 3,
    Failed = 4,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Paused,
            3 => Self::Completed,
            _ => Self::Failed,
        }
    }

    /// The job is not executing and holds no lock.
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Paused | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a spawned job, used for cancellation and joining.
pub struct JobHandle {
    pub id: JobId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, cancel, task }
    }

    /// Ask the job to stop at its next batch boundary. Returns false if a
    /// cancellation was already requested.
    pub fn cancel(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        true
    }

    /// Wait for the job task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(job_id = self.id, "job task panicked or was aborted: {e}");
        }
    }
}

/// Progress snapshot of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub current: u64,
    pub total: u64,
    pub message: Option<String>,
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_discriminants() {
        assert_eq!(JobStatus::Created as u8, 0);
        assert_eq!(JobStatus::Running as u8, 1);
        assert_eq!(JobStatus::Paused as u8, 2);
        assert_eq!(JobStatus::Completed as u8, 3);
        assert_eq!(JobStatus::Failed as u8, 4);
        for v in 0..5u8 {
            assert_eq!(JobStatus::from_u8(v) as u8, v);
        }
    }

    #[test]
    fn test_job_status_parse_roundtrip() {
        for s in [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
        assert!(!JobStatus::Running.is_stopped());
        assert!(JobStatus::Paused.is_stopped());
    }

    #[tokio::test]
    async fn test_job_handle_cancel() {
        let token = CancellationToken::new();
        let handle = JobHandle::new(1, token.clone(), tokio::spawn(async {}));
        assert!(handle.cancel());
        assert!(!handle.cancel(), "second cancel is a no-op");
        assert!(token.is_cancelled());
        handle.join().await;
    }

    #[test]
    fn test_job_progress_serialize() {
        let progress = JobProgress {
            job_id: 1,
            job_type: "horses-pedigree".to_string(),
            status: JobStatus::Running,
            current: 300,
            total: 1000,
            message: Some("batch 3".to_string()),
            timestamp: "2026-02-05T12:00:00Z".to_string(),
        };
        let json = serde_json::to_string(&progress).unwrap();
        assert!(json.contains("\"jobId\":1"));
        assert!(json.contains("\"jobType\":\"horses-pedigree\""));
        assert!(json.contains("\"status\":\"running\""));
        assert!(json.contains("\"current\":300"));
    }
}
