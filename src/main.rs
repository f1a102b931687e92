use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use panel_backup::config::{AppConfig, ConfigError};
use panel_backup::context::AppContext;
use panel_backup::core::credentials::provider_from_config;
use panel_backup::core::{
    BackupOrchestrator, CredentialProvider, OAuthCredentialProvider, PanelClient, RunReport,
    ServiceAccountProvider,
};
use panel_backup::{db, logging};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "panel-backup")]
#[command(about = "Back up a game panel server to Google Drive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backup and exit
    Run,
    /// Run backups on a fixed schedule until interrupted
    Daemon {
        #[arg(long)]
        interval_minutes: Option<u64>,
    },
    /// Authorize Google Drive access and save the token
    Auth,
    /// Show recent runs from the history database
    Status {
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
}

#[derive(Args)]
struct GlobalArgs {
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    verbose: Option<bool>,

    /// Emit JSON log lines
    #[arg(long, global = true, num_args = 0..=1, default_missing_value = "true")]
    json: Option<bool>,
}

/// CLI values layered over the config file and environment.
#[derive(Serialize)]
struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<ScheduleOverride>,
}

#[derive(Serialize)]
struct ScheduleOverride {
    interval_minutes: u64,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        let interval_minutes = match &self.command {
            Commands::Daemon { interval_minutes } => *interval_minutes,
            _ => None,
        };

        ConfigOverrides {
            verbose: self.global.verbose,
            json_logs: self.global.json,
            schedule: interval_minutes.map(|interval_minutes| ScheduleOverride { interval_minutes }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config, Some(&cli.overrides())) {
        Ok(config) => config,
        Err(e @ (ConfigError::Missing { .. } | ConfigError::Placeholder { .. })) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
        Err(e) => return Err(e).context("Failed to load configuration"),
    };

    logging::init(logging::LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Run => {
            let ctx = AppContext::init(config).await?;
            run_once(&ctx).await.context("Failed to run backup")?;
        }
        Commands::Daemon { .. } => {
            let ctx = AppContext::init(config).await?;
            run_daemon(ctx).await.context("Daemon stopped with an error")?
        }
        Commands::Auth => run_auth(&config).await.context("Failed to authorize Google Drive")?,
        Commands::Status { limit } => run_status(&config, limit)
            .await
            .context("Failed to read run history")?,
    }

    Ok(())
}

async fn run_once(ctx: &AppContext) -> Result<RunReport> {
    let host = PanelClient::new(&ctx.config.panel).context("Failed to build panel client")?;
    let credentials =
        provider_from_config(&ctx.config.auth).context("Failed to load Drive credentials")?;

    let mut orchestrator = BackupOrchestrator::new(ctx.config.clone(), host, credentials)
        .context("Failed to build transfer clients")?;
    if let Some(db) = &ctx.db {
        orchestrator = orchestrator.with_history(db.clone());
    }

    Ok(orchestrator.run().await)
}

async fn run_daemon(ctx: AppContext) -> Result<()> {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Shutdown requested, stopping after the current run");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });

    let interval = ctx.config.schedule.interval();
    info!(
        interval_minutes = ctx.config.schedule.interval_minutes,
        "Backup daemon started"
    );

    loop {
        let started = Instant::now();
        let report = run_once(&ctx).await?;
        if !report.succeeded() {
            error!(run_id = %report.run_id, failed_phase = ?report.failed_phase, "Scheduled backup failed");
        }

        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("Backup daemon stopped");
    Ok(())
}

async fn run_auth(config: &AppConfig) -> Result<()> {
    if let Some(path) = &config.auth.service_account_file {
        // Nothing to authorize interactively; check the key works.
        let provider = ServiceAccountProvider::from_file(path)?;
        let credential = provider.get_valid_credential().await?;
        println!(
            "Service account {} can access Drive (token expires {}).",
            provider.client_email(),
            credential.expires_at()
        );
        return Ok(());
    }

    let provider = OAuthCredentialProvider::new(&config.auth);
    let credential = provider.authorize().await?;
    println!(
        "Authorized. Token saved to {} (expires {}).",
        config.auth.token_file.display(),
        credential.expires_at()
    );
    Ok(())
}

async fn run_status(config: &AppConfig, limit: u32) -> Result<()> {
    let Some(path) = &config.paths.history_db else {
        bail!("Run history is disabled (paths.history_db is not set)");
    };
    if !path.exists() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    let conn = db::init(path).await?;
    let runs = db::runs::recent(&conn, limit).await?;
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        println!(
            "{}  {}  {:<8}  job={}  drive={}",
            run.started_at,
            run.id,
            run.final_state.as_deref().unwrap_or(&run.last_status),
            run.job_id.as_deref().unwrap_or("-"),
            run.drive_file_id.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
