//! Remediation workflow: turn vulnerabilities into proposed fixes, route
//! them through a human decision, and execute what was approved.

pub mod executor;
pub mod policy;

pub use policy::ApprovalPolicy;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::engine::AnalysisEngine;
use crate::errors::{ApprovalError, StoreError};
use crate::models::{
    AnalysisJob, ApprovalDecision, ApprovalStatus, EstimatedRisk, HumanApproval, JobStatus,
    ProposedAction, Severity, Vulnerability,
};
use crate::repo::SourceRepoClient;
use crate::store::JobStore;

/// Risk estimate for applying a proposed fix automatically. Low confidence
/// dominates; a confident fix for a severe finding is still a careful merge.
pub fn estimate_risk(confidence: u8, severity: Severity) -> EstimatedRisk {
    if confidence < 60 {
        EstimatedRisk::High
    } else if matches!(severity, Severity::Critical | Severity::High) {
        EstimatedRisk::Medium
    } else {
        EstimatedRisk::Low
    }
}

/// The snippet handed to the engine and recorded as the action's original
/// code: the numbered line when the finding has one, the whole file when it
/// does not (the executor then falls back to plain text replacement).
fn vulnerable_snippet<'a>(vuln: &Vulnerability, content: &'a str) -> &'a str {
    match vuln.line {
        Some(line) => content
            .lines()
            .nth(line.saturating_sub(1) as usize)
            .unwrap_or(content),
        None => content,
    }
}

pub struct RemediationWorkflow {
    store: Arc<dyn JobStore>,
    repo: Arc<dyn SourceRepoClient>,
    engine: Arc<dyn AnalysisEngine>,
}

impl RemediationWorkflow {
    pub fn new(
        store: Arc<dyn JobStore>,
        repo: Arc<dyn SourceRepoClient>,
        engine: Arc<dyn AnalysisEngine>,
    ) -> Self {
        Self {
            store,
            repo,
            engine,
        }
    }

    /// Ask the engine for a fix per vulnerability. A failed or unmatchable
    /// vulnerability is logged and skipped; proposing fixes never fails a run.
    pub async fn propose_actions(
        &self,
        vulnerabilities: &[Vulnerability],
        files: &HashMap<String, String>,
    ) -> Vec<ProposedAction> {
        let mut actions = Vec::new();
        for vuln in vulnerabilities {
            let Some(content) = files.get(&vuln.file) else {
                warn!(file = %vuln.file, vulnerability = %vuln.id, "no content for vulnerability; skipping fix");
                continue;
            };
            let snippet = vulnerable_snippet(vuln, content);
            let proposal = match self
                .engine
                .propose_fix(&vuln.file, snippet, &vuln.vuln_type, vuln.severity)
                .await
            {
                Ok(proposal) => proposal,
                Err(e) => {
                    warn!(
                        file = %vuln.file,
                        vulnerability = %vuln.id,
                        error = %e,
                        "fix proposal failed; skipping"
                    );
                    continue;
                }
            };
            actions.push(ProposedAction {
                id: Uuid::new_v4().to_string(),
                vulnerability_id: vuln.id.clone(),
                file: vuln.file.clone(),
                line: vuln.line,
                severity: vuln.severity,
                original_code: snippet.to_string(),
                proposed_code: proposal.fixed_code,
                description: proposal.description,
                confidence: proposal.confidence,
                automated: proposal.confidence > 80,
                estimated_risk: estimate_risk(proposal.confidence, vuln.severity),
            });
        }
        actions
    }

    /// Record the human decision. Write-once: the store rejects the update
    /// unless the persisted approval is still pending, so a concurrent second
    /// decision loses cleanly.
    pub async fn decide(
        &self,
        job_id: &str,
        decision: ApprovalDecision,
        selected_action_ids: Option<&[String]>,
        actor: Option<String>,
        comments: Option<String>,
    ) -> Result<AnalysisJob, ApprovalError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ApprovalError::JobNotFound { id: job_id.into() })?;

        match &job.approval {
            Some(approval) if approval.status != ApprovalStatus::Pending => {
                return Err(ApprovalError::AlreadyDecided { id: job_id.into() });
            }
            Some(_) if job.status == JobStatus::AwaitingApproval => {}
            _ => {
                return Err(ApprovalError::NotAwaitingApproval { id: job_id.into() });
            }
        }

        let all_ids: Vec<String> = job.proposed_actions.iter().map(|a| a.id.clone()).collect();
        let (status, approved) = match decision {
            ApprovalDecision::ApproveAll => (ApprovalStatus::Approved, all_ids.clone()),
            ApprovalDecision::RejectAll => (ApprovalStatus::Rejected, Vec::new()),
            ApprovalDecision::Partial => {
                let selected = selected_action_ids.unwrap_or(&[]);
                for id in selected {
                    if job.action(id).is_none() {
                        return Err(ApprovalError::UnknownAction {
                            job_id: job_id.into(),
                            action_id: id.clone(),
                        });
                    }
                }
                (ApprovalStatus::Partial, selected.to_vec())
            }
        };
        let rejected: Vec<String> = all_ids
            .iter()
            .filter(|id| !approved.contains(id))
            .cloned()
            .collect();

        let approval = HumanApproval {
            status,
            approved_actions: approved,
            rejected_actions: rejected,
            actor,
            decided_at: Some(Utc::now()),
            comments,
        };

        self.store
            .record_approval(job_id, &approval)
            .await
            .map_err(|e| match e {
                StoreError::Conflict { .. } => ApprovalError::AlreadyDecided { id: job_id.into() },
                other => ApprovalError::Store(other),
            })?;

        job.approval = Some(approval);
        Ok(job)
    }

    /// Full decision flow: record the decision, execute whatever was
    /// approved, and make the one permitted awaiting-approval -> completed
    /// transition with the outcomes persisted on the job.
    pub async fn submit_decision(
        &self,
        job_id: &str,
        decision: ApprovalDecision,
        selected_action_ids: Option<&[String]>,
        actor: Option<String>,
        comments: Option<String>,
    ) -> Result<AnalysisJob, ApprovalError> {
        let mut job = self
            .decide(job_id, decision, selected_action_ids, actor, comments)
            .await?;

        let approved: Vec<String> = job
            .approval
            .as_ref()
            .map(|a| a.approved_actions.clone())
            .unwrap_or_default();
        if !approved.is_empty() {
            job.remediation_results = self.execute(&job, &approved).await?;
        }

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.store.save_job(&job).await?;
        Ok(job)
    }
}
