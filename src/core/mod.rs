pub mod credentials;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod remote;
pub mod transfer;

pub use credentials::{
    Credential, CredentialProvider, OAuthCredentialProvider, ServiceAccountProvider,
};
pub use models::{BackupJob, JobId, JobProgress, JobStatus, LocalArtifact, RunReport, RunState};
pub use notifications::{BackupEvent, NotificationChannel, Notifier};
pub use orchestrator::BackupOrchestrator;
pub use remote::{BackupHost, CreateOutcome, PanelClient};
pub use transfer::{Downloader, RetryPolicy, Uploader};
