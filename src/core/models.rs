use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier the panel assigns to a backup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One status poll result, as reported by the panel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub is_complete: bool,
    /// `None` when the panel did not say.
    pub is_successful: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    /// A response without the expected fields.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn status(&self) -> JobStatus {
        match (self.is_complete, self.is_successful) {
            (true, Some(false)) => JobStatus::Failed,
            (true, _) => JobStatus::Succeeded,
            (false, Some(_)) => JobStatus::Running,
            (false, None) => JobStatus::Pending,
        }
    }
}

/// A remote backup, refreshed only from what the panel reports.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: JobId,
    pub status: JobStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupJob {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            completed_at: None,
        }
    }

    pub fn apply(&mut self, progress: &JobProgress) {
        self.status = progress.status();
        self.completed_at = progress.completed_at;
    }
}

/// Phases of one orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Creating,
    Polling,
    Downloading,
    Uploading,
    Cleaning,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Creating => "Creating",
            Self::Polling => "Polling",
            Self::Downloading => "Downloading",
            Self::Uploading => "Uploading",
            Self::Cleaning => "Cleaning",
            Self::Done => "Done",
            Self::Failed => "Failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The downloaded archive for a single run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    path: PathBuf,
}

impl LocalArtifact {
    /// Reserve `backup-<server>-<UTC timestamp>.tar.gz` inside `scratch_dir`,
    /// creating the directory if needed. No file is created.
    pub async fn allocate(
        scratch_dir: &Path,
        server_id: &str,
        now: DateTime<Utc>,
    ) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(scratch_dir).await?;
        Ok(Self {
            path: scratch_dir.join(Self::file_name(server_id, now)),
        })
    }

    pub fn file_name(server_id: &str, now: DateTime<Utc>) -> String {
        format!(
            "backup-{}-{}.tar.gz",
            server_id,
            now.format("%Y-%m-%d_%H-%M-%S")
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. A file that was never written counts as removed.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub final_state: RunState,
    /// The phase that was active when the run failed.
    pub failed_phase: Option<RunState>,
    pub job_id: Option<JobId>,
    pub artifact: Option<PathBuf>,
    pub drive_file_id: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.final_state == RunState::Done
    }
}
