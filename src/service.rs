//! Job creation entry point shared by the API, the scheduler, and the
//! webhook ingestor: validate the project, persist a pending job, and hand
//! it to the runner on a background task.

use std::sync::Arc;

use tracing::error;

use crate::errors::PipelineError;
use crate::models::{AnalysisJob, TriggerSource};
use crate::orchestrator::JobRunner;
use crate::store::JobStore;

pub struct JobService {
    store: Arc<dyn JobStore>,
    runner: Arc<JobRunner>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<JobRunner>) -> Self {
        Self { store, runner }
    }

    pub fn runner(&self) -> Arc<JobRunner> {
        Arc::clone(&self.runner)
    }

    /// Persist a pending job without running it. Validation errors leave no
    /// state behind.
    pub async fn create_job(
        &self,
        project_id: &str,
        commit_ref: Option<&str>,
        triggered_by: TriggerSource,
        changed_files: Option<Vec<String>>,
        user_id: Option<String>,
    ) -> Result<AnalysisJob, PipelineError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound {
                id: project_id.to_string(),
            })?;

        let mut job = AnalysisJob::new(
            project_id,
            commit_ref.unwrap_or(&project.default_branch),
            triggered_by,
        );
        job.changed_files = changed_files;
        job.user_id = user_id;
        self.store.create_job(&job).await?;
        Ok(job)
    }

    /// Create a job and drive it on a detached task. The returned job is the
    /// pending record; callers poll the store for progress.
    pub async fn start_job(
        &self,
        project_id: &str,
        commit_ref: Option<&str>,
        triggered_by: TriggerSource,
        changed_files: Option<Vec<String>>,
        user_id: Option<String>,
    ) -> Result<AnalysisJob, PipelineError> {
        let job = self
            .create_job(project_id, commit_ref, triggered_by, changed_files, user_id)
            .await?;
        self.spawn_run(&job.id);
        Ok(job)
    }

    pub fn spawn_run(&self, job_id: &str) {
        let runner = Arc::clone(&self.runner);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = runner.run_job(&job_id).await {
                // The runner already persisted the failure; this is the last
                // trace of errors that had nowhere else to go.
                error!(job_id, error = %e, "background job run failed");
            }
        });
    }
}
