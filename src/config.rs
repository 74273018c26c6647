use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Runtime configuration, read from the environment (a `.env` file is loaded
/// by `main` before this runs).
///
/// The repository client seam carries no project parameter, so one vigil
/// deployment is scoped to one repository host project; fleets run one
/// deployment per repository.
#[derive(Debug, Clone)]
pub struct VigilConfig {
    pub database_path: PathBuf,
    pub repo_base_url: String,
    pub repo_project: String,
    pub repo_token: String,
    pub engine_base_url: String,
    pub engine_api_key: Option<String>,
    pub max_files_per_scan: usize,
    pub analysis_concurrency: usize,
    pub scheduler_tick_secs: u64,
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}", name)),
        Err(_) => Ok(default),
    }
}

impl VigilConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: std::env::var("VIGIL_DB")
                .unwrap_or_else(|_| "vigil.db".to_string())
                .into(),
            repo_base_url: std::env::var("VIGIL_REPO_URL")
                .context("VIGIL_REPO_URL must be set")?,
            repo_project: std::env::var("VIGIL_REPO_PROJECT")
                .context("VIGIL_REPO_PROJECT must be set")?,
            repo_token: std::env::var("VIGIL_REPO_TOKEN")
                .context("VIGIL_REPO_TOKEN must be set")?,
            engine_base_url: std::env::var("VIGIL_ENGINE_URL")
                .context("VIGIL_ENGINE_URL must be set")?,
            engine_api_key: std::env::var("VIGIL_ENGINE_API_KEY").ok(),
            max_files_per_scan: parse_env("VIGIL_MAX_FILES", 10)?,
            analysis_concurrency: parse_env("VIGIL_ANALYSIS_CONCURRENCY", 4)?,
            scheduler_tick_secs: parse_env("VIGIL_SCHEDULER_TICK_SECS", 3600)?,
        })
    }
}
