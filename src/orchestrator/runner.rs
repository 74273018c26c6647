use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info, warn};

use super::delta;
use crate::engine::{AnalysisEngine, FileReport, Finding};
use crate::errors::{EngineError, PipelineError, RepoError};
use crate::models::{
    AnalysisJob, HistoryEntry, HumanApproval, JobStage, JobStatus, Severity, TriggerSource,
    Vulnerability,
};
use crate::remediation::{ApprovalPolicy, RemediationWorkflow};
use crate::repo::SourceRepoClient;
use crate::store::JobStore;

/// Score assumed for a file the engine could not score, and for a run in
/// which no file was successfully analyzed.
const DEFAULT_FILE_SCORE: u8 = 50;

/// Bounds on the per-run analysis work.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Files analyzed per run, in listing order.
    pub max_files: usize,
    /// Concurrent fetch/analyze calls. Results are always merged back in
    /// listing order, so raising this never changes scoring.
    pub analysis_concurrency: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            analysis_concurrency: 4,
        }
    }
}

impl ScanLimits {
    pub fn with_max_files(mut self, max: usize) -> Self {
        self.max_files = max;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.analysis_concurrency = concurrency;
        self
    }
}

/// round(mean) of per-file scores; the default score when none were produced.
pub fn average_score(scores: &[u8]) -> u8 {
    if scores.is_empty() {
        return DEFAULT_FILE_SCORE;
    }
    let sum: f64 = scores.iter().map(|&s| f64::from(s)).sum();
    (sum / scores.len() as f64).round() as u8
}

/// Max-severity reduction: the worst finding sets the level, never an average.
pub fn overall_threat_level(vulnerabilities: &[Vulnerability]) -> Severity {
    vulnerabilities
        .iter()
        .map(|v| v.severity)
        .max()
        .unwrap_or(Severity::Low)
}

fn lift_findings(path: &str, findings: Vec<Finding>) -> Vec<Vulnerability> {
    findings
        .into_iter()
        .map(|f| Vulnerability {
            id: Vulnerability::fingerprint(path, f.line, &f.vuln_type),
            file: path.to_string(),
            line: f.line,
            severity: f.severity,
            vuln_type: f.vuln_type,
            description: f.description,
            confidence: f.confidence,
            exploitability: f.exploitability,
            impact: f.impact,
        })
        .collect()
}

/// Drives one analysis job end to end. All external work goes through the
/// injected seams; the runner owns only sequencing, scoring, and persistence.
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    repo: Arc<dyn SourceRepoClient>,
    engine: Arc<dyn AnalysisEngine>,
    workflow: Arc<RemediationWorkflow>,
    limits: ScanLimits,
    policy: ApprovalPolicy,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        repo: Arc<dyn SourceRepoClient>,
        engine: Arc<dyn AnalysisEngine>,
        workflow: Arc<RemediationWorkflow>,
    ) -> Self {
        Self {
            store,
            repo,
            engine,
            workflow,
            limits: ScanLimits::default(),
            policy: ApprovalPolicy::default(),
        }
    }

    pub fn with_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the job to a terminal state. A job that is not pending (someone
    /// else won the claim, or it already ran) is skipped silently: the
    /// compare-and-set against the store is the one source of truth for
    /// at-most-one active run per job.
    pub async fn run_job(&self, job_id: &str) -> Result<(), PipelineError> {
        if self.store.get_job(job_id).await?.is_none() {
            return Err(PipelineError::JobNotFound { id: job_id.into() });
        }
        if !self.store.claim_job(job_id, Utc::now()).await? {
            debug!(job_id, "job is not pending; skipping duplicate invocation");
            return Ok(());
        }
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::JobNotFound { id: job_id.into() })?;

        match self.execute(&mut job).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(job_id, error = %e, "analysis job failed");
                job.status = JobStatus::Failed;
                job.stage = None;
                job.error = Some(e.to_string());
                job.failed_at = Some(Utc::now());
                if let Err(save_err) = self.store.save_job(&job).await {
                    error!(job_id, error = %save_err, "could not persist job failure");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &mut AnalysisJob) -> Result<(), PipelineError> {
        let project = self
            .store
            .get_project(&job.project_id)
            .await?
            .ok_or_else(|| PipelineError::ProjectNotFound {
                id: job.project_id.clone(),
            })?;
        info!(job_id = %job.id, project = %project.id, commit_ref = %job.commit_ref, "starting analysis run");

        let previous = self.store.latest_completed_job(&job.project_id).await?;
        job.previous_job_id = previous.as_ref().map(|p| p.id.clone());

        // Fetch the file listing. This is a single-shot step: total failure
        // fails the job, unlike anything per-file later on.
        self.store
            .update_stage(&job.id, JobStage::FetchingCode)
            .await?;
        job.stage = Some(JobStage::FetchingCode);
        let listed = self
            .repo
            .list_files(&job.commit_ref)
            .await
            .map_err(|e| PipelineError::ListingFailed {
                reference: job.commit_ref.clone(),
                source: e,
            })?;
        let change_scope = self.resolve_change_scope(job).await;
        let all_paths: Vec<String> = match change_scope {
            Some(changed) => {
                let changed: HashSet<&str> = changed.iter().map(String::as_str).collect();
                listed
                    .iter()
                    .filter(|f| changed.contains(f.path.as_str()))
                    .map(|f| f.path.clone())
                    .collect()
            }
            None => listed.iter().map(|f| f.path.clone()).collect(),
        };

        // Fetch content for the analysis batch; failures are counted and the
        // file is dropped from the run.
        self.store
            .update_stage(&job.id, JobStage::StaticAnalysis)
            .await?;
        job.stage = Some(JobStage::StaticAnalysis);
        let targets: Vec<String> = all_paths.iter().take(self.limits.max_files).cloned().collect();
        let reference = job.commit_ref.clone();
        let contents = self.fetch_contents(&reference, &targets, job).await;

        // Per-file engine calls, merged in listing order.
        self.store
            .update_stage(&job.id, JobStage::AiAnalysis)
            .await?;
        job.stage = Some(JobStage::AiAnalysis);
        let scores = self.analyze_files(&contents, job).await;
        job.security_score = Some(average_score(&scores));

        // Threat modeling is the other single-shot step.
        self.store
            .update_stage(&job.id, JobStage::ThreatModeling)
            .await?;
        job.stage = Some(JobStage::ThreatModeling);
        let model = self
            .engine
            .build_threat_model(&all_paths)
            .await
            .map_err(PipelineError::ThreatModeling)?;
        job.threat_model = Some(model);
        job.threat_level = Some(overall_threat_level(&job.vulnerabilities));

        let files: HashMap<String, String> = contents.into_iter().collect();
        job.proposed_actions = self
            .workflow
            .propose_actions(&job.vulnerabilities, &files)
            .await;

        let needs_approval = self.policy.requires_review(&job.proposed_actions);
        let (new_count, resolved_count) = delta::diff_counts(
            &job.vulnerabilities,
            previous.as_ref().map_or(&[], |p| &p.vulnerabilities[..]),
        );

        job.stage = None;
        job.progress = 100;
        if needs_approval {
            job.status = JobStatus::AwaitingApproval;
            job.approval = Some(HumanApproval::pending());
            info!(job_id = %job.id, actions = job.proposed_actions.len(), "run gated on human approval");
        } else {
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            info!(job_id = %job.id, score = ?job.security_score, "run completed");
        }
        self.store.save_job(job).await?;

        self.store
            .append_history(&HistoryEntry {
                job_id: job.id.clone(),
                project_id: job.project_id.clone(),
                recorded_at: Utc::now(),
                security_score: job.security_score.unwrap_or(DEFAULT_FILE_SCORE),
                threat_level: job.threat_level.unwrap_or(Severity::Low),
                new_vulnerabilities: new_count,
                resolved_vulnerabilities: resolved_count,
                triggered_by: job.triggered_by,
            })
            .await?;
        Ok(())
    }

    /// Paths the analysis should be restricted to, if any. Webhook jobs
    /// carry the pushed file list; one enqueued without it falls back to the
    /// commit diff. A failed diff lookup widens to the full listing rather
    /// than failing the run.
    async fn resolve_change_scope(&self, job: &AnalysisJob) -> Option<Vec<String>> {
        match &job.changed_files {
            Some(changed) if !changed.is_empty() => Some(changed.clone()),
            _ if job.triggered_by == TriggerSource::Webhook => {
                match self.repo.list_changed_files(&job.commit_ref).await {
                    Ok(paths) if !paths.is_empty() => Some(paths),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(job_id = %job.id, error = %e, "commit diff lookup failed; analyzing full listing");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Bounded-concurrency content fetch. `buffered` yields results in input
    /// order regardless of completion order.
    async fn fetch_contents(
        &self,
        reference: &str,
        targets: &[String],
        job: &mut AnalysisJob,
    ) -> Vec<(String, String)> {
        let mut futs: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<String, RepoError>)> + Send>>,
        > = Vec::new();
        for path in targets.iter() {
            let repo = Arc::clone(&self.repo);
            let path = path.clone();
            let reference = reference.to_string();
            futs.push(Box::pin(async move {
                let result = repo.get_file_content(&path, &reference).await;
                (path, result)
            }));
        }
        let results: Vec<(String, Result<String, RepoError>)> = stream::iter(futs)
            .buffered(self.limits.analysis_concurrency.max(1))
            .collect()
            .await;

        let mut contents = Vec::new();
        for (path, result) in results {
            match result {
                Ok(content) => contents.push((path, content)),
                Err(e) => {
                    warn!(job_id = %job.id, file = %path, error = %e, "file fetch failed; skipping");
                    job.analysis_errors += 1;
                }
            }
        }
        contents
    }

    /// Analyze fetched files, accumulating vulnerabilities onto the job and
    /// returning the per-file scores that were produced.
    async fn analyze_files(
        &self,
        contents: &[(String, String)],
        job: &mut AnalysisJob,
    ) -> Vec<u8> {
        let mut futs: Vec<
            std::pin::Pin<Box<dyn std::future::Future<Output = (String, Result<FileReport, EngineError>)> + Send>>,
        > = Vec::new();
        for (path, content) in contents.iter() {
            let engine = Arc::clone(&self.engine);
            let path = path.clone();
            let content = content.clone();
            futs.push(Box::pin(async move {
                let result = engine.analyze_file(&content, &path).await;
                (path, result)
            }));
        }
        let results: Vec<(String, Result<FileReport, EngineError>)> = stream::iter(futs)
            .buffered(self.limits.analysis_concurrency.max(1))
            .collect()
            .await;

        let mut scores = Vec::new();
        let mut seen: HashSet<String> = job.vulnerabilities.iter().map(|v| v.id.clone()).collect();
        for (path, result) in results {
            match result {
                Ok(report) => {
                    scores.push(report.security_score.unwrap_or(DEFAULT_FILE_SCORE));
                    for vuln in lift_findings(&path, report.findings) {
                        if seen.insert(vuln.id.clone()) {
                            job.vulnerabilities.push(vuln);
                        }
                    }
                }
                Err(e) => {
                    warn!(job_id = %job.id, file = %path, error = %e, "file analysis failed; skipping");
                    job.analysis_errors += 1;
                }
            }
        }
        scores
    }
}
