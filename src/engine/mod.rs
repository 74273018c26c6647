//! Code analysis engine seam. The engine scores one file at a time, proposes
//! a fix for one vulnerability at a time, and builds a threat model from a
//! file listing. Prompting and model choice live behind the service boundary.

pub mod http;

pub use http::HttpEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::{Severity, ThreatModel};

/// One raw finding in a file. Carries no identity; the orchestrator assigns
/// the stable fingerprint id when lifting findings into vulnerabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub line: Option<u32>,
    pub severity: Severity,
    pub vuln_type: String,
    pub description: String,
    pub confidence: f64,
    pub exploitability: f64,
    pub impact: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub findings: Vec<Finding>,
    /// 0-100; engines may omit it for files they cannot score.
    pub security_score: Option<u8>,
    pub threat_level: Option<Severity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    pub fixed_code: String,
    /// 0-100.
    pub confidence: u8,
    pub description: String,
}

#[async_trait]
pub trait AnalysisEngine: Send + Sync {
    async fn analyze_file(&self, content: &str, path: &str) -> Result<FileReport, EngineError>;

    async fn propose_fix(
        &self,
        file: &str,
        code: &str,
        vuln_type: &str,
        severity: Severity,
    ) -> Result<FixProposal, EngineError>;

    async fn build_threat_model(&self, paths: &[String]) -> Result<ThreatModel, EngineError>;
}
