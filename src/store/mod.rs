//! Durable job store: CRUD plus the optimistic updates the orchestrator
//! leans on (run claiming, stage progression, approval decisions).

pub mod db;

pub use db::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StoreError;
use crate::models::{
    AnalysisJob, HistoryEntry, HumanApproval, JobStage, JobStatus, Project, ProjectScanConfig,
    ScanCadence,
};

/// Query filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub project_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub fn for_project(project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            ..Self::default()
        }
    }
}

/// Persistence seam for jobs, history, projects, and scan configs.
///
/// Implementations must make `claim_job`, `save_job`, and `record_approval`
/// atomic with respect to each other: the orchestrator's at-most-one-run
/// guarantee and the single-decision approval gate both rest on them.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_project(&self, id: &str) -> Result<Option<Project>, StoreError>;

    async fn create_job(&self, job: &AnalysisJob) -> Result<(), StoreError>;

    async fn get_job(&self, id: &str) -> Result<Option<AnalysisJob>, StoreError>;

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, StoreError>;

    /// The project's pending or in-progress job, if any.
    async fn find_active_job(&self, project_id: &str) -> Result<Option<AnalysisJob>, StoreError>;

    /// The project's most recently completed job.
    async fn latest_completed_job(
        &self,
        project_id: &str,
    ) -> Result<Option<AnalysisJob>, StoreError>;

    /// Compare-and-set `pending` -> `in_progress`. Returns false when the job
    /// was not pending, meaning another invocation already owns the run.
    async fn claim_job(&self, id: &str, started_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Record entry into a stage. Progress is derived from the stage and
    /// clamped non-decreasing; only an in-progress job can move.
    async fn update_stage(&self, id: &str, stage: JobStage) -> Result<(), StoreError>;

    /// Persist the job's full mutable state in one write. Rejected with
    /// `Conflict` once the job is completed or failed.
    async fn save_job(&self, job: &AnalysisJob) -> Result<(), StoreError>;

    /// Write the approval decision, conditioned on the stored approval still
    /// being pending. A second decision gets `Conflict`, never an overwrite.
    async fn record_approval(
        &self,
        job_id: &str,
        approval: &HumanApproval,
    ) -> Result<(), StoreError>;

    async fn append_history(&self, entry: &HistoryEntry) -> Result<(), StoreError>;

    async fn history_for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Trend query: a project's history, optionally bounded to a
    /// recorded-time range.
    async fn history_for_project(
        &self,
        project_id: &str,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn scan_configs_by_cadence(
        &self,
        cadence: ScanCadence,
    ) -> Result<Vec<ProjectScanConfig>, StoreError>;

    async fn scan_config_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<ProjectScanConfig>, StoreError>;

    async fn touch_last_scan(
        &self,
        project_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
