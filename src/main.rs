use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil::api::AppState;
use vigil::config::VigilConfig;
use vigil::engine::HttpEngine;
use vigil::models::{Project, ProjectScanConfig, ScanCadence};
use vigil::orchestrator::{JobRunner, ScanLimits};
use vigil::remediation::RemediationWorkflow;
use vigil::repo::GitLabClient;
use vigil::scheduler::ScanScheduler;
use vigil::service::JobService;
use vigil::store::{JobStore, SqliteStore};
use vigil::webhook::WebhookIngestor;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "Security analysis orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP command surface and the scan scheduler
    Serve {
        #[arg(long, default_value = "8080")]
        port: u16,
    },
    /// Run one analysis job to completion and print the result
    Scan {
        project_id: String,
        #[arg(long)]
        commit_ref: Option<String>,
    },
    /// Register a project, optionally with a scan cadence
    AddProject {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        repo_path: String,
        #[arg(long, default_value = "main")]
        default_branch: String,
        #[arg(long)]
        webhook_secret: Option<String>,
        #[arg(long)]
        cadence: Option<String>,
        #[arg(long, default_value = "")]
        owner: String,
    },
}

struct Components {
    store: Arc<SqliteStore>,
    jobs: Arc<JobService>,
    workflow: Arc<RemediationWorkflow>,
}

fn build_components(config: &VigilConfig) -> Result<Components> {
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let repo = Arc::new(GitLabClient::new(
        &config.repo_base_url,
        &config.repo_project,
        &config.repo_token,
    )?);
    let engine = Arc::new(HttpEngine::new(
        &config.engine_base_url,
        config.engine_api_key.clone(),
    )?);

    let workflow = Arc::new(RemediationWorkflow::new(
        store.clone() as Arc<dyn JobStore>,
        repo.clone(),
        engine.clone(),
    ));
    let runner = Arc::new(
        JobRunner::new(
            store.clone() as Arc<dyn JobStore>,
            repo,
            engine,
            workflow.clone(),
        )
        .with_limits(
            ScanLimits::default()
                .with_max_files(config.max_files_per_scan)
                .with_concurrency(config.analysis_concurrency),
        ),
    );
    let jobs = Arc::new(JobService::new(
        store.clone() as Arc<dyn JobStore>,
        runner,
    ));
    Ok(Components {
        store,
        jobs,
        workflow,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "vigil=debug" } else { "vigil=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = VigilConfig::from_env()?;

    match cli.command {
        Commands::Serve { port } => {
            let components = build_components(&config)?;
            let scheduler = Arc::new(ScanScheduler::new(
                components.store.clone() as Arc<dyn JobStore>,
                components.jobs.clone(),
                Duration::from_secs(config.scheduler_tick_secs),
            ));
            scheduler.start().await;

            let state = Arc::new(AppState {
                store: components.store.clone() as Arc<dyn JobStore>,
                jobs: components.jobs.clone(),
                workflow: components.workflow.clone(),
                scheduler: scheduler.clone(),
                ingestor: WebhookIngestor::new(
                    components.store.clone() as Arc<dyn JobStore>,
                    components.jobs.clone(),
                ),
            });
            let result = vigil::server::serve(state, port).await;
            scheduler.stop().await;
            result
        }
        Commands::Scan {
            project_id,
            commit_ref,
        } => {
            let components = build_components(&config)?;
            let job = components
                .jobs
                .create_job(
                    &project_id,
                    commit_ref.as_deref(),
                    vigil::models::TriggerSource::Manual,
                    None,
                    None,
                )
                .await?;
            if let Err(e) = components.jobs.runner().run_job(&job.id).await {
                tracing::error!(error = %e, "scan run failed");
            }
            let finished = components
                .store
                .get_job(&job.id)
                .await?
                .context("job disappeared during run")?;
            println!(
                "job {}: {} (score {:?}, threat {:?}, {} vulnerabilities, {} skipped files)",
                finished.id,
                finished.status,
                finished.security_score,
                finished.threat_level,
                finished.vulnerabilities.len(),
                finished.analysis_errors,
            );
            Ok(())
        }
        Commands::AddProject {
            id,
            name,
            repo_path,
            default_branch,
            webhook_secret,
            cadence,
            owner,
        } => {
            let store = SqliteStore::open(&config.database_path)?;
            let scan_config = cadence
                .map(|c| -> Result<ProjectScanConfig> {
                    Ok(ProjectScanConfig {
                        project_id: id.clone(),
                        cadence: c.parse::<ScanCadence>().map_err(anyhow::Error::msg)?,
                        last_scan_at: None,
                        owner,
                    })
                })
                .transpose()?;
            store
                .add_project(
                    Project {
                        id: id.clone(),
                        name: name.unwrap_or_else(|| id.clone()),
                        repo_path,
                        default_branch,
                        webhook_secret,
                        created_at: Utc::now(),
                    },
                    scan_config,
                )
                .await?;
            println!("registered project {}", id);
            Ok(())
        }
    }
}
