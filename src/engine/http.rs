//! HTTP client for a remote analysis engine service. The service owns the
//! prompt/model side; this client only speaks its JSON surface.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{AnalysisEngine, FileReport, FixProposal};
use crate::errors::EngineError;
use crate::models::{Severity, ThreatModel};

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct FixRequest<'a> {
    file: &'a str,
    code: &'a str,
    vuln_type: &'a str,
    severity: Severity,
}

#[derive(Debug, Serialize)]
struct ThreatModelRequest<'a> {
    paths: &'a [String],
}

pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEngine {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            // Engine calls sit on the per-file path; a hung call must not
            // stall the run longer than one skipped file.
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<Req: Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Req,
    ) -> Result<Resp, EngineError> {
        let mut req = self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .json(body);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }
        resp.json()
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }
}

#[async_trait]
impl AnalysisEngine for HttpEngine {
    async fn analyze_file(&self, content: &str, path: &str) -> Result<FileReport, EngineError> {
        self.post("v1/analyze", &AnalyzeRequest { path, content })
            .await
    }

    async fn propose_fix(
        &self,
        file: &str,
        code: &str,
        vuln_type: &str,
        severity: Severity,
    ) -> Result<FixProposal, EngineError> {
        self.post(
            "v1/fix",
            &FixRequest {
                file,
                code,
                vuln_type,
                severity,
            },
        )
        .await
    }

    async fn build_threat_model(&self, paths: &[String]) -> Result<ThreatModel, EngineError> {
        self.post("v1/threat-model", &ThreatModelRequest { paths })
            .await
    }
}
