//! End-to-end pipeline tests: orchestrator, remediation workflow, scheduler,
//! webhook ingestor, and the HTTP surface, wired against the in-memory store
//! and hand-rolled repository/engine fakes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::Mac;

use vigil::api::{AppState, SIGNATURE_HEADER};
use vigil::engine::{AnalysisEngine, FileReport, Finding, FixProposal};
use vigil::errors::{ApprovalError, EngineError, RepoError, WebhookError};
use vigil::models::{
    AnalysisJob, ApprovalDecision, ApprovalStatus, JobStatus, Project, ProjectScanConfig,
    ScanCadence, Severity, ThreatModel, TriggerSource,
};
use vigil::orchestrator::JobRunner;
use vigil::remediation::RemediationWorkflow;
use vigil::repo::{RepoFile, SourceRepoClient};
use vigil::scheduler::ScanScheduler;
use vigil::service::JobService;
use vigil::store::{JobFilter, JobStore, SqliteStore};
use vigil::webhook::{PushEvent, PushOutcome, WebhookIngestor};

// ── Fakes ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRepo {
    files: Vec<String>,
    contents: HashMap<String, String>,
    /// Commit diff returned by `list_changed_files`; defaults to all files.
    changed: Option<Vec<String>>,
    fail_listing: bool,
    fail_fetch: HashSet<String>,
    fail_commit_files: HashSet<String>,
    branches: Mutex<Vec<(String, String)>>,
    commits: Mutex<Vec<(String, String, String, String)>>,
    merge_requests: Mutex<Vec<(String, String, String, String)>>,
}

impl FakeRepo {
    fn with_files(files: &[(&str, &str)]) -> Self {
        let mut repo = FakeRepo::default();
        for (path, content) in files {
            repo.files.push(path.to_string());
            repo.contents.insert(path.to_string(), content.to_string());
        }
        repo
    }
}

#[async_trait]
impl SourceRepoClient for FakeRepo {
    async fn list_files(&self, _reference: &str) -> Result<Vec<RepoFile>, RepoError> {
        if self.fail_listing {
            return Err(RepoError::Transport("listing unavailable".into()));
        }
        Ok(self
            .files
            .iter()
            .map(|p| RepoFile {
                path: p.clone(),
                size: None,
            })
            .collect())
    }

    async fn get_file_content(&self, path: &str, reference: &str) -> Result<String, RepoError> {
        if self.fail_fetch.contains(path) {
            return Err(RepoError::Transport("fetch timeout".into()));
        }
        self.contents
            .get(path)
            .cloned()
            .ok_or_else(|| RepoError::FileNotFound {
                path: path.to_string(),
                reference: reference.to_string(),
            })
    }

    async fn list_changed_files(&self, _commit_ref: &str) -> Result<Vec<String>, RepoError> {
        Ok(self.changed.clone().unwrap_or_else(|| self.files.clone()))
    }

    async fn create_branch(&self, name: &str, from_ref: &str) -> Result<(), RepoError> {
        self.branches
            .lock()
            .unwrap()
            .push((name.to_string(), from_ref.to_string()));
        Ok(())
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<String, RepoError> {
        if self.fail_commit_files.contains(path) {
            return Err(RepoError::Api {
                status: 500,
                message: "commit rejected".into(),
            });
        }
        let mut commits = self.commits.lock().unwrap();
        commits.push((
            path.to_string(),
            content.to_string(),
            message.to_string(),
            branch.to_string(),
        ));
        Ok(format!("commit-{}", commits.len()))
    }

    async fn open_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<String, RepoError> {
        let mut mrs = self.merge_requests.lock().unwrap();
        mrs.push((
            source_branch.to_string(),
            target_branch.to_string(),
            title.to_string(),
            description.to_string(),
        ));
        Ok(format!("https://mr.example/{}", mrs.len()))
    }
}

#[derive(Default)]
struct FakeEngine {
    reports: HashMap<String, FileReport>,
    fail_analyze: HashSet<String>,
    fix_confidence: HashMap<String, u8>,
    fail_fix_types: HashSet<String>,
    fail_threat_model: bool,
}

#[async_trait]
impl AnalysisEngine for FakeEngine {
    async fn analyze_file(&self, _content: &str, path: &str) -> Result<FileReport, EngineError> {
        if self.fail_analyze.contains(path) {
            return Err(EngineError::Analysis {
                path: path.to_string(),
                message: "engine timeout".into(),
            });
        }
        Ok(self.reports.get(path).cloned().unwrap_or(FileReport {
            findings: vec![],
            security_score: Some(50),
            threat_level: None,
        }))
    }

    async fn propose_fix(
        &self,
        _file: &str,
        code: &str,
        vuln_type: &str,
        _severity: Severity,
    ) -> Result<FixProposal, EngineError> {
        if self.fail_fix_types.contains(vuln_type) {
            return Err(EngineError::Transport("fix service unavailable".into()));
        }
        let confidence = *self.fix_confidence.get(vuln_type).unwrap_or(&90);
        Ok(FixProposal {
            fixed_code: format!("{} // patched", code),
            confidence,
            description: format!("Neutralize {}", vuln_type),
        })
    }

    async fn build_threat_model(&self, paths: &[String]) -> Result<ThreatModel, EngineError> {
        if self.fail_threat_model {
            return Err(EngineError::Transport("model build failed".into()));
        }
        Ok(ThreatModel {
            nodes: vec![],
            edges: vec![],
            attack_vectors: vec!["injection".to_string()],
            attack_surface: paths.len() as f64,
        })
    }
}

fn finding(line: u32, severity: Severity, vuln_type: &str) -> Finding {
    Finding {
        line: Some(line),
        severity,
        vuln_type: vuln_type.to_string(),
        description: format!("{} issue", vuln_type),
        confidence: 0.9,
        exploitability: 0.5,
        impact: 0.6,
    }
}

fn report(score: u8, findings: Vec<Finding>) -> FileReport {
    FileReport {
        findings,
        security_score: Some(score),
        threat_level: None,
    }
}

// ── Harness ───────────────────────────────────────────────────────────

struct TestEnv {
    store: Arc<SqliteStore>,
    runner: Arc<JobRunner>,
    workflow: Arc<RemediationWorkflow>,
    jobs: Arc<JobService>,
    repo: Arc<FakeRepo>,
}

async fn seed_project(store: &SqliteStore, id: &str, cadence: Option<ScanCadence>) {
    store
        .add_project(
            Project {
                id: id.to_string(),
                name: id.to_string(),
                repo_path: format!("acme/{}", id),
                default_branch: "main".to_string(),
                webhook_secret: Some("hooksecret".to_string()),
                created_at: Utc::now(),
            },
            cadence.map(|cadence| ProjectScanConfig {
                project_id: id.to_string(),
                cadence,
                last_scan_at: None,
                owner: "sec-team".to_string(),
            }),
        )
        .await
        .unwrap();
}

async fn build_env_with_store(
    store: Arc<SqliteStore>,
    repo: FakeRepo,
    engine: FakeEngine,
) -> TestEnv {
    let repo = Arc::new(repo);
    let engine = Arc::new(engine);
    let workflow = Arc::new(RemediationWorkflow::new(
        store.clone() as Arc<dyn JobStore>,
        repo.clone() as Arc<dyn SourceRepoClient>,
        engine.clone() as Arc<dyn AnalysisEngine>,
    ));
    let runner = Arc::new(JobRunner::new(
        store.clone() as Arc<dyn JobStore>,
        repo.clone() as Arc<dyn SourceRepoClient>,
        engine.clone() as Arc<dyn AnalysisEngine>,
        workflow.clone(),
    ));
    let jobs = Arc::new(JobService::new(
        store.clone() as Arc<dyn JobStore>,
        runner.clone(),
    ));
    TestEnv {
        store,
        runner,
        workflow,
        jobs,
        repo,
    }
}

async fn build_env(repo: FakeRepo, engine: FakeEngine) -> TestEnv {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_project(&store, "p1", None).await;
    build_env_with_store(store, repo, engine).await
}

/// Create a manual job for p1 and run it to its terminal state.
async fn run_manual_job(env: &TestEnv) -> AnalysisJob {
    let job = env
        .jobs
        .create_job("p1", Some("main"), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let _ = env.runner.run_job(&job.id).await;
    env.store.get_job(&job.id).await.unwrap().unwrap()
}

/// Insert a completed job for a project, completed `hours_ago`.
async fn seed_completed_job(store: &SqliteStore, project_id: &str, hours_ago: i64) -> AnalysisJob {
    let mut job = AnalysisJob::new(project_id, "main", TriggerSource::Scheduled);
    store.create_job(&job).await.unwrap();
    store.claim_job(&job.id, Utc::now()).await.unwrap();
    job.status = JobStatus::Completed;
    job.progress = 100;
    job.security_score = Some(70);
    job.threat_level = Some(Severity::Low);
    job.completed_at = Some(Utc::now() - chrono::Duration::hours(hours_ago));
    store.save_job(&job).await.unwrap();
    job
}

fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn push_payload(project_id: &str, git_ref: &str, after: &str, modified: &[&str]) -> String {
    serde_json::json!({
        "object_kind": "push",
        "project_id": project_id,
        "ref": git_ref,
        "after": after,
        "commits": [{ "added": [], "modified": modified, "removed": [] }],
    })
    .to_string()
}

// ── Orchestrator ──────────────────────────────────────────────────────

#[tokio::test]
async fn completed_run_averages_scores_and_appends_history() {
    let repo = FakeRepo::with_files(&[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}"), ("c.rs", "fn c() {}")]);
    let mut engine = FakeEngine::default();
    engine.reports.insert("a.rs".into(), report(80, vec![]));
    engine.reports.insert("b.rs".into(), report(60, vec![]));
    engine.reports.insert("c.rs".into(), report(40, vec![]));

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.security_score, Some(60));
    assert_eq!(job.threat_level, Some(Severity::Low));
    assert_eq!(job.progress, 100);
    assert!(job.stage.is_none());
    assert!(job.completed_at.is_some());
    assert_eq!(job.analysis_errors, 0);

    let history = env.store.history_for_job(&job.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].security_score, 60);
    assert_eq!(history[0].new_vulnerabilities, 0);
    assert_eq!(history[0].triggered_by, TriggerSource::Manual);
}

#[tokio::test]
async fn run_with_no_analyzable_files_scores_default() {
    let env = build_env(FakeRepo::default(), FakeEngine::default()).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.security_score, Some(50));
    assert_eq!(job.threat_level, Some(Severity::Low));
}

#[tokio::test]
async fn per_file_failures_are_counted_not_fatal() {
    let files: Vec<(String, String)> = (0..10)
        .map(|i| (format!("f{}.rs", i), format!("fn f{}() {{}}", i)))
        .collect();
    let file_refs: Vec<(&str, &str)> = files
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    let mut repo = FakeRepo::with_files(&file_refs);
    repo.fail_fetch.insert("f1.rs".into());
    repo.fail_fetch.insert("f3.rs".into());

    let mut engine = FakeEngine::default();
    for (path, _) in &files {
        engine.reports.insert(
            path.clone(),
            report(60, vec![finding(1, Severity::Low, "hardcoded_secret")]),
        );
    }

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.analysis_errors, 2);
    assert_eq!(job.vulnerabilities.len(), 8);
    assert_eq!(job.security_score, Some(60));
}

#[tokio::test]
async fn listing_failure_fails_the_job() {
    let mut repo = FakeRepo::default();
    repo.fail_listing = true;

    let env = build_env(repo, FakeEngine::default()).await;
    let job = env
        .jobs
        .create_job("p1", Some("main"), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    let result = env.runner.run_job(&job.id).await;
    assert!(result.is_err());

    let job = env.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.failed_at.is_some());
    assert!(job.error.as_deref().unwrap().contains("listing"));
    assert!(env.store.history_for_job(&job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn threat_model_failure_fails_the_job() {
    let repo = FakeRepo::with_files(&[("a.rs", "fn a() {}")]);
    let mut engine = FakeEngine::default();
    engine.fail_threat_model = true;

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("model build failed"));
    assert!(env.store.history_for_job(&job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_project_fails_the_job() {
    let env = build_env(FakeRepo::default(), FakeEngine::default()).await;
    let job = AnalysisJob::new("ghost", "main", TriggerSource::Manual);
    env.store.create_job(&job).await.unwrap();

    assert!(env.runner.run_job(&job.id).await.is_err());
    let job = env.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("ghost"));
}

#[tokio::test]
async fn duplicate_invocation_is_a_silent_noop() {
    let repo = FakeRepo::with_files(&[("a.rs", "fn a() {}")]);
    let env = build_env(repo, FakeEngine::default()).await;
    let job = run_manual_job(&env).await;
    assert_eq!(job.status, JobStatus::Completed);

    // Second invocation on the finished job: no error, no new history.
    env.runner.run_job(&job.id).await.unwrap();
    assert_eq!(env.store.history_for_job(&job.id).await.unwrap().len(), 1);

    // And on a job someone else holds in progress: untouched.
    let contended = env
        .jobs
        .create_job("p1", Some("main"), TriggerSource::Manual, None, None)
        .await
        .unwrap();
    assert!(env.store.claim_job(&contended.id, Utc::now()).await.unwrap());
    env.runner.run_job(&contended.id).await.unwrap();
    let contended = env.store.get_job(&contended.id).await.unwrap().unwrap();
    assert_eq!(contended.status, JobStatus::InProgress);
    assert_eq!(contended.progress, 0);
    assert!(contended.vulnerabilities.is_empty());
}

#[tokio::test]
async fn webhook_jobs_scope_analysis_to_changed_files() {
    let repo = FakeRepo::with_files(&[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(30, vec![finding(1, Severity::Low, "xss")]));
    engine
        .reports
        .insert("b.rs".into(), report(90, vec![finding(1, Severity::Low, "csrf")]));

    let env = build_env(repo, engine).await;
    let job = env
        .jobs
        .create_job(
            "p1",
            Some("abc123"),
            TriggerSource::Webhook,
            Some(vec!["a.rs".to_string()]),
            None,
        )
        .await
        .unwrap();
    let _ = env.runner.run_job(&job.id).await;
    let job = env.store.get_job(&job.id).await.unwrap().unwrap();

    // Only a.rs was analyzed: its score and its finding, nothing from b.rs.
    assert_eq!(job.security_score, Some(30));
    assert_eq!(job.vulnerabilities.len(), 1);
    assert_eq!(job.vulnerabilities[0].file, "a.rs");
}

#[tokio::test]
async fn webhook_job_without_file_list_scopes_via_commit_diff() {
    let mut repo = FakeRepo::with_files(&[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);
    repo.changed = Some(vec!["b.rs".to_string()]);
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(20, vec![]));
    engine
        .reports
        .insert("b.rs".into(), report(90, vec![]));

    let env = build_env(repo, engine).await;
    let job = env
        .jobs
        .create_job("p1", Some("abc123"), TriggerSource::Webhook, None, None)
        .await
        .unwrap();
    let _ = env.runner.run_job(&job.id).await;
    let job = env.store.get_job(&job.id).await.unwrap().unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.security_score, Some(90), "only the diffed file is scored");
}

#[tokio::test]
async fn delta_tracks_new_and_resolved_across_runs() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_project(&store, "p1", None).await;

    let repo1 = FakeRepo::with_files(&[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]);
    let mut engine1 = FakeEngine::default();
    engine1
        .reports
        .insert("a.rs".into(), report(70, vec![finding(1, Severity::Low, "sqli")]));
    engine1
        .reports
        .insert("b.rs".into(), report(70, vec![finding(2, Severity::Low, "xss")]));
    let env1 = build_env_with_store(store.clone(), repo1, engine1).await;
    let first = run_manual_job(&env1).await;
    assert_eq!(first.status, JobStatus::Completed);

    let history = store.history_for_job(&first.id).await.unwrap();
    assert_eq!(history[0].new_vulnerabilities, 2);
    assert_eq!(history[0].resolved_vulnerabilities, 0);

    // Second run: the sqli persists, the xss is gone, an ssrf appears.
    let repo2 = FakeRepo::with_files(&[("a.rs", "fn a() {}"), ("c.rs", "fn c() {}")]);
    let mut engine2 = FakeEngine::default();
    engine2
        .reports
        .insert("a.rs".into(), report(70, vec![finding(1, Severity::Low, "sqli")]));
    engine2
        .reports
        .insert("c.rs".into(), report(70, vec![finding(3, Severity::Low, "ssrf")]));
    let env2 = build_env_with_store(store.clone(), repo2, engine2).await;
    let second = run_manual_job(&env2).await;

    assert_eq!(second.previous_job_id.as_deref(), Some(first.id.as_str()));
    let history = store.history_for_job(&second.id).await.unwrap();
    assert_eq!(history[0].new_vulnerabilities, 1);
    assert_eq!(history[0].resolved_vulnerabilities, 1);
}

// ── Remediation workflow ──────────────────────────────────────────────

fn gated_repo_and_engine() -> (FakeRepo, FakeEngine) {
    let repo = FakeRepo::with_files(&[("src/db.rs", "let q = raw(input);\nrun(q);\n")]);
    let mut engine = FakeEngine::default();
    engine.reports.insert(
        "src/db.rs".into(),
        report(35, vec![finding(1, Severity::High, "sqli")]),
    );
    (repo, engine)
}

#[tokio::test]
async fn high_severity_actions_gate_on_approval() {
    let (repo, engine) = gated_repo_and_engine();
    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::AwaitingApproval);
    assert_eq!(job.progress, 100);
    assert!(job.completed_at.is_none());
    let approval = job.approval.as_ref().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Pending);

    assert_eq!(job.proposed_actions.len(), 1);
    let action = &job.proposed_actions[0];
    assert_eq!(action.file, "src/db.rs");
    assert_eq!(action.original_code, "let q = raw(input);");
    assert!(action.automated, "confidence 90 should mark the fix automated");

    // History is appended on this non-failed terminal transition too.
    assert_eq!(env.store.history_for_job(&job.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn approve_all_executes_fixes_and_completes() {
    let (repo, engine) = gated_repo_and_engine();
    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;
    assert_eq!(job.status, JobStatus::AwaitingApproval);

    let job = env
        .workflow
        .submit_decision(
            &job.id,
            ApprovalDecision::ApproveAll,
            None,
            Some("alice".to_string()),
            Some("ship it".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.completed_at.is_some());
    assert_eq!(job.remediation_results.len(), 1);
    let outcome = &job.remediation_results[0];
    assert!(outcome.success);
    assert!(outcome.commit_ref.is_some());
    assert!(outcome.merge_request_ref.is_some());

    let branches = env.repo.branches.lock().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].1, "main", "branch must come from the job's base ref");

    let commits = env.repo.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].1.contains("let q = raw(input); // patched"));
    assert!(commits[0].1.contains("run(q);"));

    let mrs = env.repo.merge_requests.lock().unwrap();
    assert_eq!(mrs.len(), 1);
    assert_eq!(mrs[0].1, "main", "merge request targets the tracked branch");
    assert!(mrs[0].3.contains("high"));

    // Approval is terminal: the persisted job rejects a second decision.
    let err = env
        .workflow
        .submit_decision(&job.id, ApprovalDecision::RejectAll, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::AlreadyDecided { .. }));
    let stored = env.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.approval.unwrap().status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn reject_all_completes_without_repository_writes() {
    let (repo, engine) = gated_repo_and_engine();
    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    let job = env
        .workflow
        .submit_decision(&job.id, ApprovalDecision::RejectAll, None, None, None)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.remediation_results.is_empty());
    assert_eq!(job.approval.as_ref().unwrap().status, ApprovalStatus::Rejected);
    assert!(env.repo.branches.lock().unwrap().is_empty());
    assert!(env.repo.commits.lock().unwrap().is_empty());
}

#[tokio::test]
async fn partial_decision_executes_only_selected_actions() {
    let repo = FakeRepo::with_files(&[
        ("a.rs", "alpha_bad();\n"),
        ("b.rs", "beta_bad();\n"),
    ]);
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(40, vec![finding(1, Severity::High, "sqli")]));
    engine
        .reports
        .insert("b.rs".into(), report(40, vec![finding(1, Severity::High, "xss")]));

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;
    assert_eq!(job.proposed_actions.len(), 2);

    // Unknown ids are rejected before anything is written.
    let err = env
        .workflow
        .submit_decision(
            &job.id,
            ApprovalDecision::Partial,
            Some(&["nope".to_string()]),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApprovalError::UnknownAction { .. }));
    let stored = env.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.approval.unwrap().status, ApprovalStatus::Pending);

    let selected = job
        .proposed_actions
        .iter()
        .find(|a| a.file == "a.rs")
        .unwrap()
        .id
        .clone();
    let job = env
        .workflow
        .submit_decision(
            &job.id,
            ApprovalDecision::Partial,
            Some(&[selected.clone()]),
            Some("bob".to_string()),
            None,
        )
        .await
        .unwrap();

    let approval = job.approval.as_ref().unwrap();
    assert_eq!(approval.status, ApprovalStatus::Partial);
    assert_eq!(approval.approved_actions, vec![selected]);
    assert_eq!(approval.rejected_actions.len(), 1);

    let commits = env.repo.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, "a.rs");
}

#[tokio::test]
async fn commit_failure_fails_only_that_file_batch() {
    let mut repo = FakeRepo::with_files(&[
        ("a.rs", "alpha_bad();\n"),
        ("b.rs", "beta_bad();\n"),
    ]);
    repo.fail_commit_files.insert("a.rs".into());
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(40, vec![finding(1, Severity::High, "sqli")]));
    engine
        .reports
        .insert("b.rs".into(), report(40, vec![finding(1, Severity::High, "xss")]));

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;
    let job = env
        .workflow
        .submit_decision(&job.id, ApprovalDecision::ApproveAll, None, None, None)
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.remediation_results.len(), 2);
    let by_success: HashMap<bool, usize> =
        job.remediation_results
            .iter()
            .fold(HashMap::new(), |mut acc, outcome| {
                *acc.entry(outcome.success).or_default() += 1;
                acc
            });
    assert_eq!(by_success.get(&true), Some(&1));
    assert_eq!(by_success.get(&false), Some(&1));

    let commits = env.repo.commits.lock().unwrap();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].0, "b.rs");
}

#[tokio::test]
async fn confident_low_risk_actions_complete_without_gate() {
    let repo = FakeRepo::with_files(&[("a.rs", "meh();\n")]);
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(80, vec![finding(1, Severity::Low, "weak_hash")]));

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.proposed_actions.len(), 1);
    assert!(job.approval.is_none());
}

#[tokio::test]
async fn low_confidence_fix_triggers_the_gate() {
    let repo = FakeRepo::with_files(&[("a.rs", "meh();\n")]);
    let mut engine = FakeEngine::default();
    engine
        .reports
        .insert("a.rs".into(), report(80, vec![finding(1, Severity::Low, "weak_hash")]));
    engine.fix_confidence.insert("weak_hash".into(), 65);

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::AwaitingApproval);
    let action = &job.proposed_actions[0];
    assert!(!action.automated);
    assert_eq!(action.confidence, 65);
}

#[tokio::test]
async fn failed_fix_proposals_are_skipped() {
    let repo = FakeRepo::with_files(&[("a.rs", "one();\ntwo();\n")]);
    let mut engine = FakeEngine::default();
    engine.reports.insert(
        "a.rs".into(),
        report(
            50,
            vec![
                finding(1, Severity::Low, "weak_hash"),
                finding(2, Severity::Low, "weak_rng"),
            ],
        ),
    );
    engine.fail_fix_types.insert("weak_rng".into());

    let env = build_env(repo, engine).await;
    let job = run_manual_job(&env).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.vulnerabilities.len(), 2);
    assert_eq!(job.proposed_actions.len(), 1, "failed proposal is skipped, not fatal");
}

// ── Scheduler ─────────────────────────────────────────────────────────

#[tokio::test]
async fn daily_sweep_respects_freshness_window() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_project(&store, "fresh", Some(ScanCadence::Daily)).await;
    seed_project(&store, "stale", Some(ScanCadence::Daily)).await;
    seed_completed_job(&store, "fresh", 10).await;
    seed_completed_job(&store, "stale", 25).await;

    let env = build_env_with_store(store.clone(), FakeRepo::default(), FakeEngine::default()).await;
    let scheduler = ScanScheduler::new(
        store.clone() as Arc<dyn JobStore>,
        env.jobs.clone(),
        Duration::from_secs(3600),
    );

    let summary = scheduler.run_due(ScanCadence::Daily).await.unwrap();
    assert_eq!(summary.triggered, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.failed, 0);

    let fresh_jobs = store.list_jobs(&JobFilter::for_project("fresh")).await.unwrap();
    assert_eq!(fresh_jobs.len(), 1, "fresh project must not be re-enqueued");

    let stale_jobs = store.list_jobs(&JobFilter::for_project("stale")).await.unwrap();
    assert_eq!(stale_jobs.len(), 2);
    let enqueued = stale_jobs
        .iter()
        .find(|j| j.triggered_by == TriggerSource::Scheduled && j.commit_ref == "latest")
        .expect("scheduled job with ref 'latest'");
    assert_eq!(enqueued.project_id, "stale");

    let config = store.scan_config_for_project("stale").await.unwrap().unwrap();
    assert!(config.last_scan_at.is_some());
}

#[tokio::test]
async fn sweep_skips_projects_with_active_jobs() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_project(&store, "busy", Some(ScanCadence::Daily)).await;
    let env = build_env_with_store(store.clone(), FakeRepo::default(), FakeEngine::default()).await;

    // A pending job is already queued for the project.
    env.jobs
        .create_job("busy", Some("main"), TriggerSource::Manual, None, None)
        .await
        .unwrap();

    let scheduler = ScanScheduler::new(
        store.clone() as Arc<dyn JobStore>,
        env.jobs.clone(),
        Duration::from_secs(3600),
    );
    let summary = scheduler.run_due(ScanCadence::Daily).await.unwrap();
    assert_eq!(summary.triggered, 0);
    assert_eq!(summary.skipped, 1);
    assert_eq!(store.list_jobs(&JobFilter::for_project("busy")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn one_project_failure_does_not_block_the_sweep() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    // A scan config whose project record is gone, next to a healthy one.
    store
        .add_project(
            Project {
                id: "healthy".to_string(),
                name: "healthy".to_string(),
                repo_path: "acme/healthy".to_string(),
                default_branch: "main".to_string(),
                webhook_secret: None,
                created_at: Utc::now(),
            },
            Some(ProjectScanConfig {
                project_id: "healthy".to_string(),
                cadence: ScanCadence::Weekly,
                last_scan_at: None,
                owner: "sec-team".to_string(),
            }),
        )
        .await
        .unwrap();
    let orphan = ProjectScanConfig {
        project_id: "ghost".to_string(),
        cadence: ScanCadence::Weekly,
        last_scan_at: None,
        owner: "sec-team".to_string(),
    };
    store.add_scan_config(orphan).await.unwrap();

    let env = build_env_with_store(store.clone(), FakeRepo::default(), FakeEngine::default()).await;
    let scheduler = ScanScheduler::new(
        store.clone() as Arc<dyn JobStore>,
        env.jobs.clone(),
        Duration::from_secs(3600),
    );
    let summary = scheduler.run_due(ScanCadence::Weekly).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.triggered, 1);
    assert_eq!(store.list_jobs(&JobFilter::for_project("healthy")).await.unwrap().len(), 1);
}

#[tokio::test]
async fn scheduler_lifecycle_starts_and_stops() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let env = build_env_with_store(store.clone(), FakeRepo::default(), FakeEngine::default()).await;
    let scheduler = Arc::new(ScanScheduler::new(
        store as Arc<dyn JobStore>,
        env.jobs.clone(),
        Duration::from_secs(3600),
    ));
    scheduler.start().await;
    scheduler.start().await; // idempotent
    scheduler.stop().await;
}

// ── Webhook ingestor ──────────────────────────────────────────────────

async fn webhook_env(cadence: Option<ScanCadence>) -> (TestEnv, WebhookIngestor) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    seed_project(&store, "p1", cadence).await;
    let env = build_env_with_store(
        store,
        FakeRepo::with_files(&[("a.rs", "fn a() {}")]),
        FakeEngine::default(),
    )
    .await;
    let ingestor = WebhookIngestor::new(
        env.store.clone() as Arc<dyn JobStore>,
        env.jobs.clone(),
    );
    (env, ingestor)
}

#[tokio::test]
async fn push_with_bad_signature_is_rejected() {
    let (env, ingestor) = webhook_env(Some(ScanCadence::OnEvent)).await;
    let payload = push_payload("p1", "refs/heads/main", "abc123", &["a.rs"]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let err = ingestor
        .handle_push("sha256=deadbeef", payload.as_bytes(), &event)
        .await
        .unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));
    assert!(env.store.list_jobs(&JobFilter::for_project("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn push_to_untracked_branch_is_ignored_with_valid_signature() {
    let (env, ingestor) = webhook_env(Some(ScanCadence::OnEvent)).await;
    let payload = push_payload("p1", "refs/heads/feature-x", "abc123", &["a.rs"]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let outcome = ingestor
        .handle_push(&sign("hooksecret", payload.as_bytes()), payload.as_bytes(), &event)
        .await
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Ignored { .. }));
    assert!(env.store.list_jobs(&JobFilter::for_project("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn push_is_ignored_without_on_event_cadence() {
    let (env, ingestor) = webhook_env(Some(ScanCadence::Daily)).await;
    let payload = push_payload("p1", "refs/heads/main", "abc123", &["a.rs"]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let outcome = ingestor
        .handle_push(&sign("hooksecret", payload.as_bytes()), payload.as_bytes(), &event)
        .await
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Ignored { .. }));
    assert!(env.store.list_jobs(&JobFilter::for_project("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn push_with_no_scan_config_is_ignored() {
    let (env, ingestor) = webhook_env(None).await;
    let payload = push_payload("p1", "refs/heads/main", "abc123", &["a.rs"]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let outcome = ingestor
        .handle_push(&sign("hooksecret", payload.as_bytes()), payload.as_bytes(), &event)
        .await
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Ignored { .. }));
    assert!(env.store.list_jobs(&JobFilter::for_project("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn push_with_empty_change_set_is_ignored() {
    let (env, ingestor) = webhook_env(Some(ScanCadence::OnEvent)).await;
    let payload = push_payload("p1", "refs/heads/main", "abc123", &[]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let outcome = ingestor
        .handle_push(&sign("hooksecret", payload.as_bytes()), payload.as_bytes(), &event)
        .await
        .unwrap();
    assert!(matches!(outcome, PushOutcome::Ignored { .. }));
    assert!(env.store.list_jobs(&JobFilter::for_project("p1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn valid_push_enqueues_a_webhook_job() {
    let (_env, ingestor) = webhook_env(Some(ScanCadence::OnEvent)).await;
    let payload = push_payload("p1", "refs/heads/main", "abc123", &["a.rs", "b.rs"]);
    let event: PushEvent = serde_json::from_str(&payload).unwrap();

    let outcome = ingestor
        .handle_push(&sign("hooksecret", payload.as_bytes()), payload.as_bytes(), &event)
        .await
        .unwrap();
    let PushOutcome::Accepted { job } = outcome else {
        panic!("expected the push to be accepted");
    };
    assert_eq!(job.commit_ref, "abc123");
    assert_eq!(job.triggered_by, TriggerSource::Webhook);
    assert_eq!(
        job.changed_files.as_deref(),
        Some(&["a.rs".to_string(), "b.rs".to_string()][..])
    );
}

// ── HTTP surface ──────────────────────────────────────────────────────

mod http_surface {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn app(cadence: Option<ScanCadence>) -> (TestEnv, axum::Router) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        seed_project(&store, "p1", cadence).await;
        let env = build_env_with_store(
            store,
            FakeRepo::with_files(&[("a.rs", "fn a() {}")]),
            FakeEngine::default(),
        )
        .await;
        let scheduler = Arc::new(ScanScheduler::new(
            env.store.clone() as Arc<dyn JobStore>,
            env.jobs.clone(),
            Duration::from_secs(3600),
        ));
        let state = Arc::new(AppState {
            store: env.store.clone() as Arc<dyn JobStore>,
            jobs: env.jobs.clone(),
            workflow: env.workflow.clone(),
            scheduler,
            ingestor: WebhookIngestor::new(
                env.store.clone() as Arc<dyn JobStore>,
                env.jobs.clone(),
            ),
        });
        let router = vigil::server::build_router(state);
        (env, router)
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (_env, router) = app(None).await;
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let (_env, router) = app(None).await;
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/jobs/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_job_returns_accepted_with_pending_job() {
        let (_env, router) = app(None).await;
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/projects/p1/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"commit_ref": "main"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let job: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(job["project_id"], "p1");
        assert_eq!(job["triggered_by"], "manual");
    }

    #[tokio::test]
    async fn webhook_route_rejects_bad_signature() {
        let (_env, router) = app(Some(ScanCadence::OnEvent)).await;
        let payload = push_payload("p1", "refs/heads/main", "abc123", &["a.rs"]);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/push")
                    .header("content-type", "application/json")
                    .header(SIGNATURE_HEADER, "sha256=deadbeef")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_route_reports_ignored_pushes_as_ok() {
        let (_env, router) = app(Some(ScanCadence::OnEvent)).await;
        let payload = push_payload("p1", "refs/heads/feature", "abc123", &["a.rs"]);
        let signature = sign("hooksecret", payload.as_bytes());
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/webhooks/push")
                    .header("content-type", "application/json")
                    .header(SIGNATURE_HEADER, signature)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ignored");
    }

    #[tokio::test]
    async fn project_history_route_supports_time_ranges() {
        let (env, router) = app(None).await;
        seed_completed_job(&env.store, "p1", 2).await;

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/projects/p1/history?from=2020-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(entries.is_array());
    }

    #[tokio::test]
    async fn scheduler_route_runs_a_sweep() {
        let (_env, router) = app(Some(ScanCadence::Daily)).await;
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/scheduler/run")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"cadence": "daily"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let summary: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summary["triggered"], 1);
    }
}
