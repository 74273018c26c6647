//! Typed error hierarchy for the vigil pipeline.
//!
//! One enum per subsystem seam:
//! - `StoreError`: job store failures and optimistic-update conflicts
//! - `RepoError`: source repository client failures
//! - `EngineError`: analysis engine failures
//! - `PipelineError`: orchestrator-level failures
//! - `ApprovalError`: remediation decision failures
//! - `WebhookError`: push-event ingestion failures

use thiserror::Error;

/// Errors from the job store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Conflicting update: {message}")]
    Conflict { message: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// Errors from the source repository client.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("File {path} not found at {reference}")]
    FileNotFound { path: String, reference: String },

    #[error("Repository API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Repository transport error: {0}")]
    Transport(String),
}

/// Errors from the code analysis engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Analysis failed for {path}: {message}")]
    Analysis { path: String, message: String },

    #[error("Engine API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Engine transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by the job orchestrator.
///
/// A lost claim (another invocation owns the run) is not an error at all:
/// the runner skips silently. Transient per-file errors never appear here;
/// they are caught, counted, and skipped inside the run. Anything that does
/// escape marks the job failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("File listing failed at {reference}: {source}")]
    ListingFailed {
        reference: String,
        #[source]
        source: RepoError,
    },

    #[error("Threat modeling failed: {0}")]
    ThreatModeling(#[source] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from submitting an approval decision.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Job {id} is not awaiting approval")]
    NotAwaitingApproval { id: String },

    #[error("A decision was already recorded for job {id}")]
    AlreadyDecided { id: String },

    #[error("Unknown action id {action_id} for job {job_id}")]
    UnknownAction { job_id: String, action_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the webhook ingestor.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    Malformed(String),

    #[error("Failed to enqueue webhook job: {0}")]
    Enqueue(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
