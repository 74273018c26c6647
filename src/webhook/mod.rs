//! Push-webhook ingestor: authenticate the raw payload, filter events down
//! to the ones that should scan, and enqueue a job for the pushed commit.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};

use crate::errors::WebhookError;
use crate::models::{AnalysisJob, ScanCadence, TriggerSource};
use crate::service::JobService;
use crate::store::JobStore;

/// Parsed push payload (provider-agnostic subset).
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(default)]
    pub object_kind: String,
    pub project_id: String,
    /// Full ref, e.g. "refs/heads/main".
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Head commit id of the push.
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl PushEvent {
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Files worth scanning: added and modified paths across the push, in
    /// first-seen order. Removed paths have nothing left to analyze.
    pub fn changed_files(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut files = Vec::new();
        for commit in &self.commits {
            for path in commit.added.iter().chain(commit.modified.iter()) {
                if seen.insert(path.clone()) {
                    files.push(path.clone());
                }
            }
        }
        files
    }
}

/// Constant-time HMAC-SHA256 check over the raw payload bytes. Accepts the
/// conventional "sha256=" header prefix.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// What the ingestor did with a push. `Ignored` is a successful response,
/// not an error: most pushes are simply not scan triggers.
#[derive(Debug)]
pub enum PushOutcome {
    Accepted { job: AnalysisJob },
    Ignored { reason: &'static str },
}

pub struct WebhookIngestor {
    store: Arc<dyn JobStore>,
    jobs: Arc<JobService>,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn JobStore>, jobs: Arc<JobService>) -> Self {
        Self { store, jobs }
    }

    /// Authenticate and filter one push event. The signature is checked
    /// before any other handling; only the unknown-project lookup precedes
    /// it, because the shared secret lives on the project record.
    pub async fn handle_push(
        &self,
        signature: &str,
        raw_payload: &[u8],
        event: &PushEvent,
    ) -> Result<PushOutcome, WebhookError> {
        let Some(project) = self.store.get_project(&event.project_id).await? else {
            debug!(project = %event.project_id, "push for unknown project");
            return Ok(PushOutcome::Ignored {
                reason: "unknown project",
            });
        };
        let Some(secret) = project.webhook_secret.as_deref() else {
            return Err(WebhookError::InvalidSignature);
        };
        if !verify_signature(secret, raw_payload, signature) {
            return Err(WebhookError::InvalidSignature);
        }

        if event.object_kind != "push" {
            return Ok(PushOutcome::Ignored {
                reason: "not a push event",
            });
        }
        if event.branch() != Some(project.default_branch.as_str()) {
            return Ok(PushOutcome::Ignored {
                reason: "ref is not the tracked branch",
            });
        }
        let Some(config) = self.store.scan_config_for_project(&project.id).await? else {
            return Ok(PushOutcome::Ignored {
                reason: "no scan config for project",
            });
        };
        if config.cadence != ScanCadence::OnEvent {
            return Ok(PushOutcome::Ignored {
                reason: "project does not scan on push",
            });
        }
        let changed = event.changed_files();
        if changed.is_empty() {
            return Ok(PushOutcome::Ignored {
                reason: "push changed no files",
            });
        }

        let job = self
            .jobs
            .start_job(
                &project.id,
                Some(&event.after),
                TriggerSource::Webhook,
                Some(changed),
                None,
            )
            .await?;
        info!(project = %project.id, job_id = %job.id, commit = %event.after, "push accepted; job enqueued");
        Ok(PushOutcome::Accepted { job })
    }
}
