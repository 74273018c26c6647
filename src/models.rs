use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Provider slug, e.g. "acme/billing".
    pub repo_path: String,
    /// Branch watched by the webhook ingestor and targeted by merge requests.
    pub default_branch: String,
    /// Shared secret for push-webhook signatures. Unset means pushes are rejected.
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Pending and in-progress jobs count against the one-active-run-per-project
    /// dedup the scheduler performs.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// No further mutation is allowed out of these states, with the single
    /// exception of `AwaitingApproval` -> `Completed` once a decision lands.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AwaitingApproval | Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Named phase within an in-progress run. Progress is derived from the stage
/// and nowhere else, so the two signals cannot drift apart.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    FetchingCode,
    StaticAnalysis,
    AiAnalysis,
    ThreatModeling,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchingCode => "fetching_code",
            Self::StaticAnalysis => "static_analysis",
            Self::AiAnalysis => "ai_analysis",
            Self::ThreatModeling => "threat_modeling",
        }
    }

    /// Percent complete implied by entering this stage.
    pub fn progress(&self) -> u8 {
        match self {
            Self::FetchingCode => 10,
            Self::StaticAnalysis => 30,
            Self::AiAnalysis => 60,
            Self::ThreatModeling => 80,
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetching_code" => Ok(Self::FetchingCode),
            "static_analysis" => Ok(Self::StaticAnalysis),
            "ai_analysis" => Ok(Self::AiAnalysis),
            "threat_modeling" => Ok(Self::ThreatModeling),
            _ => Err(format!("Invalid job stage: {}", s)),
        }
    }
}

/// Variant order matters: `Ord` is used to reduce a job's vulnerabilities to
/// its overall threat level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Webhook,
    Scheduled,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("Invalid trigger source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanCadence {
    OnEvent,
    Daily,
    Weekly,
}

impl ScanCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnEvent => "on_event",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    /// Minimum age of the last completed job before another scheduled run is
    /// due. Shorter than the nominal cadence to tolerate scheduler jitter.
    pub fn freshness_window(&self) -> Option<chrono::Duration> {
        match self {
            Self::OnEvent => None,
            Self::Daily => Some(chrono::Duration::hours(20)),
            Self::Weekly => Some(chrono::Duration::days(6)),
        }
    }
}

impl std::fmt::Display for ScanCadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanCadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_event" => Ok(Self::OnEvent),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            _ => Err(format!("Invalid scan cadence: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectScanConfig {
    pub project_id: String,
    pub cadence: ScanCadence,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vulnerability {
    /// Content fingerprint of (file, line, type), stable across runs so the
    /// new/resolved delta compares like with like.
    pub id: String,
    pub file: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub vuln_type: String,
    pub description: String,
    pub confidence: f64,
    pub exploitability: f64,
    pub impact: f64,
}

impl Vulnerability {
    pub fn fingerprint(file: &str, line: Option<u32>, vuln_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file.as_bytes());
        hasher.update(b"|");
        match line {
            Some(n) => hasher.update(n.to_string().as_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update(b"|");
        hasher.update(vuln_type.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EstimatedRisk {
    Low,
    Medium,
    High,
}

impl EstimatedRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for EstimatedRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate automated code fix for one vulnerability, pending approval.
/// Immutable once the approval decision begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub id: String,
    pub vulnerability_id: String,
    pub file: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub original_code: String,
    pub proposed_code: String,
    pub description: String,
    /// Fix confidence reported by the engine, 0-100.
    pub confidence: u8,
    pub automated: bool,
    pub estimated_risk: EstimatedRisk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Partial,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Partial => "partial",
        }
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The human gate. Exactly one per job; terminal once it leaves `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanApproval {
    pub status: ApprovalStatus,
    pub approved_actions: Vec<String>,
    pub rejected_actions: Vec<String>,
    pub actor: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl HumanApproval {
    pub fn pending() -> Self {
        Self {
            status: ApprovalStatus::Pending,
            approved_actions: Vec::new(),
            rejected_actions: Vec::new(),
            actor: None,
            decided_at: None,
            comments: None,
        }
    }
}

/// Requested decision kind, as submitted by the reviewer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    ApproveAll,
    RejectAll,
    Partial,
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve_all" => Ok(Self::ApproveAll),
            "reject_all" => Ok(Self::RejectAll),
            "partial" => Ok(Self::Partial),
            _ => Err(format!("Invalid approval decision: {}", s)),
        }
    }
}

/// Result of executing one approved action against the repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub commit_ref: Option<String>,
    pub merge_request_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatNode {
    pub id: String,
    pub label: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatEdge {
    pub from: String,
    pub to: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatModel {
    pub nodes: Vec<ThreatNode>,
    pub edges: Vec<ThreatEdge>,
    pub attack_vectors: Vec<String>,
    /// Aggregate exposure score, 0-100.
    pub attack_surface: f64,
}

/// One run of the pipeline against a project at a given reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub project_id: String,
    pub user_id: Option<String>,
    pub commit_ref: String,
    pub status: JobStatus,
    pub stage: Option<JobStage>,
    pub progress: u8,
    pub vulnerabilities: Vec<Vulnerability>,
    pub security_score: Option<u8>,
    pub threat_level: Option<Severity>,
    pub threat_model: Option<ThreatModel>,
    pub proposed_actions: Vec<ProposedAction>,
    pub approval: Option<HumanApproval>,
    pub remediation_results: Vec<ActionOutcome>,
    pub previous_job_id: Option<String>,
    pub triggered_by: TriggerSource,
    /// Pushed-file list carried by webhook jobs; scopes the analysis.
    pub changed_files: Option<Vec<String>>,
    /// Per-file failures that were skipped rather than failing the run.
    pub analysis_errors: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn new(project_id: &str, commit_ref: &str, triggered_by: TriggerSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            user_id: None,
            commit_ref: commit_ref.to_string(),
            status: JobStatus::Pending,
            stage: None,
            progress: 0,
            vulnerabilities: Vec::new(),
            security_score: None,
            threat_level: None,
            threat_model: None,
            proposed_actions: Vec::new(),
            approval: None,
            remediation_results: Vec::new(),
            previous_job_id: None,
            triggered_by,
            changed_files: None,
            analysis_errors: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn action(&self, action_id: &str) -> Option<&ProposedAction> {
        self.proposed_actions.iter().find(|a| a.id == action_id)
    }
}

/// Immutable trend snapshot appended on every non-failed terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: String,
    pub project_id: String,
    pub recorded_at: DateTime<Utc>,
    pub security_score: u8,
    pub threat_level: Severity,
    pub new_vulnerabilities: u32,
    pub resolved_vulnerabilities: u32,
    pub triggered_by: TriggerSource,
}

/// Job plus its appended history, as returned by the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: AnalysisJob,
    pub history: Vec<HistoryEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::AwaitingApproval,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_terminal_and_active_states() {
        assert!(JobStatus::Pending.is_active());
        assert!(JobStatus::InProgress.is_active());
        assert!(!JobStatus::Completed.is_active());

        assert!(JobStatus::AwaitingApproval.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_stage_progress_is_monotonic_in_stage_order() {
        let stages = [
            JobStage::FetchingCode,
            JobStage::StaticAnalysis,
            JobStage::AiAnalysis,
            JobStage::ThreatModeling,
        ];
        for pair in stages.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
        assert_eq!(JobStage::FetchingCode.progress(), 10);
        assert_eq!(JobStage::ThreatModeling.progress(), 80);
    }

    #[test]
    fn test_severity_ordering_supports_max_reduction() {
        let severities = vec![Severity::Medium, Severity::Critical, Severity::Low];
        assert_eq!(severities.into_iter().max(), Some(Severity::Critical));
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low < Severity::Medium);
    }

    #[test]
    fn test_cadence_freshness_windows() {
        assert_eq!(
            ScanCadence::Daily.freshness_window(),
            Some(chrono::Duration::hours(20))
        );
        assert_eq!(
            ScanCadence::Weekly.freshness_window(),
            Some(chrono::Duration::days(6))
        );
        assert_eq!(ScanCadence::OnEvent.freshness_window(), None);
    }

    #[test]
    fn test_fingerprint_is_stable_and_keyed_on_content() {
        let a = Vulnerability::fingerprint("src/auth.rs", Some(42), "sql_injection");
        let b = Vulnerability::fingerprint("src/auth.rs", Some(42), "sql_injection");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        assert_ne!(
            a,
            Vulnerability::fingerprint("src/auth.rs", Some(43), "sql_injection")
        );
        assert_ne!(
            a,
            Vulnerability::fingerprint("src/auth.rs", Some(42), "xss")
        );
        assert_ne!(
            Vulnerability::fingerprint("a.rs", None, "xss"),
            Vulnerability::fingerprint("a.rs", Some(0), "xss")
        );
    }

    #[test]
    fn test_new_job_starts_pending_with_zero_progress() {
        let job = AnalysisJob::new("proj-1", "main", TriggerSource::Manual);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.stage.is_none());
        assert!(job.vulnerabilities.is_empty());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_pending_approval_constructor() {
        let approval = HumanApproval::pending();
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert!(approval.approved_actions.is_empty());
        assert!(approval.decided_at.is_none());
    }
}
