//! Drives one backup run through its phases: create, poll, download,
//! upload, cleanup.
//!
//! Failures inside a phase end the run with exactly one failure
//! notification. Only credential and unexpected local I/O errors escape a
//! phase; those are reported once by the top-level handler in [`BackupOrchestrator::run`].

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio_rusqlite::Connection;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::credentials::CredentialProvider;
use crate::core::models::{BackupJob, JobId, JobStatus, LocalArtifact, RunReport, RunState};
use crate::core::notifications::{BackupEvent, Notifier};
use crate::core::remote::{BackupHost, CreateOutcome};
use crate::core::transfer::{Downloader, Uploader};
use crate::db;
use crate::error::{AuthError, TransferError};

#[derive(Debug, Error)]
enum OrchestratorError {
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mutable state of the run in flight.
struct RunProgress {
    run_id: String,
    state: RunState,
    failed_phase: Option<RunState>,
    job_id: Option<JobId>,
    artifact: Option<LocalArtifact>,
    drive_file_id: Option<String>,
}

impl RunProgress {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            failed_phase: None,
            job_id: None,
            artifact: None,
            drive_file_id: None,
        }
    }

    fn into_report(self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            final_state: self.state,
            failed_phase: self.failed_phase,
            job_id: self.job_id,
            artifact: self.artifact.map(|a| a.path().to_path_buf()),
            drive_file_id: self.drive_file_id,
        }
    }
}

pub struct BackupOrchestrator<H: BackupHost, C: CredentialProvider> {
    config: Arc<AppConfig>,
    host: H,
    credentials: C,
    downloader: Downloader,
    uploader: Uploader,
    notifier: Notifier,
    history: Option<Connection>,
}

impl<H: BackupHost, C: CredentialProvider> BackupOrchestrator<H, C> {
    pub fn new(config: Arc<AppConfig>, host: H, credentials: C) -> Result<Self, TransferError> {
        let downloader = Downloader::new(config.download.retry_policy(), config.download.timeout())?;
        let uploader = Uploader::new(
            config.upload.retry_policy(),
            &config.drive.upload_base,
            config.drive.chunk_size_bytes,
        )?;
        let notifier = Notifier::from_config(&config.notifications);

        Ok(Self {
            config,
            host,
            credentials,
            downloader,
            uploader,
            notifier,
            history: None,
        })
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_history(mut self, history: Connection) -> Self {
        self.history = Some(history);
        self
    }

    /// Execute one complete run. Never fails; the outcome is in the report.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::now_v7().to_string();
        let span = info_span!("backup_run", run_id = %run_id, server_id = %self.config.panel.server_id);

        async {
            let mut run = RunProgress::new(run_id);
            self.record_start(&run).await;
            info!("Backup run started");

            if let Err(e) = self.execute(&mut run).await {
                error!(phase = %run.state, error = %e, "Backup run aborted");
                self.mark_failed(&mut run, Some(e.to_string())).await;
                self.notifier
                    .notify(BackupEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }

            if run.state == RunState::Failed {
                self.purge_artifact(&run).await;
            }

            self.record_finish(&run).await;
            match run.state {
                RunState::Done => info!("Backup run finished"),
                _ => warn!(failed_phase = ?run.failed_phase, "Backup run failed"),
            }
            run.into_report()
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run: &mut RunProgress) -> Result<(), OrchestratorError> {
        let Some(job_id) = self.create(run).await else {
            return Ok(());
        };

        if self.await_completion(run, &job_id).await.is_none() {
            return Ok(());
        }

        let Some(artifact) = self.download(run, &job_id).await? else {
            return Ok(());
        };

        if !self.upload(run, &artifact).await? {
            return Ok(());
        }

        self.cleanup(run, &job_id, &artifact).await;
        self.transition(run, RunState::Done, None).await;
        Ok(())
    }

    async fn create(&self, run: &mut RunProgress) -> Option<JobId> {
        self.transition(run, RunState::Creating, None).await;
        self.notifier.notify(BackupEvent::Started).await;

        match self.host.create_job().await {
            Ok(CreateOutcome::Created(job_id)) => {
                info!(job_id = %job_id, "Backup created");
                run.job_id = Some(job_id.clone());
                self.notifier
                    .notify(BackupEvent::Created {
                        job_id: job_id.clone(),
                    })
                    .await;
                Some(job_id)
            }
            Ok(CreateOutcome::Rejected { body }) => {
                self.fail(
                    run,
                    BackupEvent::BackupFailed {
                        reason: format!("Failed to create backup. Response: {}", body),
                    },
                )
                .await;
                None
            }
            Err(e) => {
                self.fail(
                    run,
                    BackupEvent::BackupFailed {
                        reason: format!("Failed to create backup: {}", e),
                    },
                )
                .await;
                None
            }
        }
    }

    /// Poll until the panel reports the backup finished or the attempt budget runs out.
    async fn await_completion(&self, run: &mut RunProgress, job_id: &JobId) -> Option<BackupJob> {
        self.transition(run, RunState::Polling, None).await;

        let max_attempts = self.config.poll.max_attempts.max(1);
        let mut job = BackupJob::new(job_id.clone());

        for attempt in 1..=max_attempts {
            match self.host.get_status(job_id).await {
                Ok(progress) => {
                    job.apply(&progress);
                    debug!(attempt, status = ?job.status, "Polled backup status");
                }
                Err(e) => warn!(attempt, error = %e, "Status check failed"),
            }

            if job.status.is_terminal() {
                break;
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.poll.interval()).await;
            }
        }

        match job.status {
            JobStatus::Succeeded => {
                info!(completed_at = ?job.completed_at, "Backup completed on the panel");
                Some(job)
            }
            JobStatus::Failed => {
                self.fail(
                    run,
                    BackupEvent::BackupFailed {
                        reason: "The panel reported the backup as unsuccessful.".to_string(),
                    },
                )
                .await;
                None
            }
            JobStatus::Pending | JobStatus::Running => {
                self.fail(
                    run,
                    BackupEvent::BackupFailed {
                        reason: "Backup did not complete in the allotted time.".to_string(),
                    },
                )
                .await;
                None
            }
        }
    }

    async fn download(
        &self,
        run: &mut RunProgress,
        job_id: &JobId,
    ) -> Result<Option<LocalArtifact>, OrchestratorError> {
        self.transition(run, RunState::Downloading, None).await;
        self.notifier.notify(BackupEvent::DownloadStarted).await;

        let url = match self.host.get_download_descriptor(job_id).await {
            Ok(url) => url,
            Err(e) => {
                self.fail(
                    run,
                    BackupEvent::DownloadFailed {
                        reason: e.to_string(),
                    },
                )
                .await;
                return Ok(None);
            }
        };

        let artifact = LocalArtifact::allocate(
            &self.config.paths.scratch_dir,
            &self.config.panel.server_id,
            Utc::now(),
        )
        .await?;
        run.artifact = Some(artifact.clone());

        match self.downloader.download(&url, artifact.path()).await {
            Ok(outcome) => {
                self.notifier
                    .notify(BackupEvent::DownloadSucceeded {
                        bytes: outcome.total_bytes,
                    })
                    .await;
                Ok(Some(artifact))
            }
            Err(e) => {
                self.fail(
                    run,
                    BackupEvent::DownloadFailed {
                        reason: e.to_string(),
                    },
                )
                .await;
                Ok(None)
            }
        }
    }

    async fn upload(
        &self,
        run: &mut RunProgress,
        artifact: &LocalArtifact,
    ) -> Result<bool, OrchestratorError> {
        self.transition(run, RunState::Uploading, None).await;
        self.notifier.notify(BackupEvent::UploadStarted).await;

        let drive = &self.config.drive;

        match self
            .uploader
            .upload(
                artifact.path(),
                &drive.folder_id,
                &drive.mime_type,
                &self.credentials,
            )
            .await
        {
            // Reported once by the top-level error handler.
            Err(TransferError::Auth(e)) => Err(OrchestratorError::Auth(e)),
            Ok(file_id) => {
                run.drive_file_id = Some(file_id.clone());
                self.notifier
                    .notify(BackupEvent::UploadSucceeded { file_id })
                    .await;
                Ok(true)
            }
            Err(e) => {
                self.fail(
                    run,
                    BackupEvent::UploadFailed {
                        reason: e.to_string(),
                    },
                )
                .await;
                Ok(false)
            }
        }
    }

    /// Local archive first, then the remote backup. Both are best-effort.
    async fn cleanup(&self, run: &mut RunProgress, job_id: &JobId, artifact: &LocalArtifact) {
        self.transition(run, RunState::Cleaning, None).await;

        match artifact.remove().await {
            Ok(()) => debug!(path = %artifact.path().display(), "Removed local archive"),
            Err(e) => warn!(path = %artifact.path().display(), error = %e, "Failed to remove local archive"),
        }

        match self.host.delete_job(job_id).await {
            Ok(()) => info!(job_id = %job_id, "Deleted backup from the panel"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to delete backup from the panel"),
        }
    }

    async fn purge_artifact(&self, run: &RunProgress) {
        let Some(artifact) = &run.artifact else {
            return;
        };

        if !self.config.cleanup.purge_on_failure {
            info!(path = %artifact.path().display(), "Keeping local archive after failure");
            return;
        }

        if let Err(e) = artifact.remove().await {
            warn!(path = %artifact.path().display(), error = %e, "Failed to purge local archive");
        }
    }

    /// End the run in the current phase and send its failure notification.
    async fn fail(&self, run: &mut RunProgress, event: BackupEvent) {
        warn!(phase = %run.state, reason = %event.description(), "{}", event.title());
        self.mark_failed(run, Some(event.description())).await;
        self.notifier.notify(event).await;
    }

    async fn mark_failed(&self, run: &mut RunProgress, description: Option<String>) {
        run.failed_phase = Some(run.state);
        self.transition(run, RunState::Failed, description).await;
    }

    async fn transition(&self, run: &mut RunProgress, state: RunState, description: Option<String>) {
        debug!(from = %run.state, to = %state, "Run state transition");
        run.state = state;

        let Some(conn) = &self.history else {
            return;
        };
        if let Err(e) = db::runs::update_status(
            conn,
            run.run_id.clone(),
            state.as_str().to_string(),
            description,
        )
        .await
        {
            warn!(error = %e, "Failed to record run status");
        }
    }

    async fn record_start(&self, run: &RunProgress) {
        let Some(conn) = &self.history else {
            return;
        };
        if let Err(e) =
            db::runs::create(conn, run.run_id.clone(), self.config.panel.server_id.clone()).await
        {
            warn!(error = %e, "Failed to record run start");
        }
    }

    async fn record_finish(&self, run: &RunProgress) {
        let Some(conn) = &self.history else {
            return;
        };
        if let Err(e) = db::runs::finish(
            conn,
            run.run_id.clone(),
            run.state.as_str().to_string(),
            run.job_id.as_ref().map(|id| id.to_string()),
            run.drive_file_id.clone(),
        )
        .await
        {
            warn!(error = %e, "Failed to record run result");
        }
    }
}
