//! GitLab-flavoured REST implementation of the source repository seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{RepoFile, SourceRepoClient};
use crate::errors::RepoError;

/// Tree entry as returned by the repository tree endpoint (subset of fields).
#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// One entry of a commit diff (subset of fields).
#[derive(Debug, Deserialize)]
struct DiffEntry {
    new_path: String,
}

#[derive(Debug, Serialize)]
struct CreateBranchRequest<'a> {
    branch: &'a str,
    #[serde(rename = "ref")]
    from_ref: &'a str,
}

#[derive(Debug, Serialize)]
struct CommitAction<'a> {
    action: &'a str,
    file_path: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    branch: &'a str,
    commit_message: &'a str,
    actions: Vec<CommitAction<'a>>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    id: String,
}

#[derive(Debug, Serialize)]
struct MergeRequestRequest<'a> {
    source_branch: &'a str,
    target_branch: &'a str,
    title: &'a str,
    description: &'a str,
}

#[derive(Debug, Deserialize)]
struct MergeRequestResponse {
    web_url: String,
}

/// Percent-encode a path segment for use inside a repository-files URL.
/// GitLab expects the whole file path as one encoded component.
pub fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for b in path.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

pub struct GitLabClient {
    client: reqwest::Client,
    base_url: String,
    /// URL-encoded project path, e.g. "acme%2Fbilling".
    project: String,
    token: String,
}

impl GitLabClient {
    pub fn new(base_url: &str, project_path: &str, token: &str) -> Result<Self, RepoError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project: encode_path(project_path),
            token: token.to_string(),
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/api/v4/projects/{}/{}", self.base_url, self.project, tail)
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, RepoError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(RepoError::Api {
            status: status.as_u16(),
            message: message.chars().take(200).collect(),
        })
    }
}

#[async_trait]
impl SourceRepoClient for GitLabClient {
    async fn list_files(&self, reference: &str) -> Result<Vec<RepoFile>, RepoError> {
        let resp = self
            .client
            .get(self.url("repository/tree"))
            .header("PRIVATE-TOKEN", &self.token)
            .query(&[("ref", reference), ("recursive", "true"), ("per_page", "100")])
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        let entries: Vec<TreeEntry> = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "blob")
            .map(|e| RepoFile {
                path: e.path,
                size: None,
            })
            .collect())
    }

    async fn get_file_content(&self, path: &str, reference: &str) -> Result<String, RepoError> {
        let resp = self
            .client
            .get(self.url(&format!("repository/files/{}/raw", encode_path(path))))
            .header("PRIVATE-TOKEN", &self.token)
            .query(&[("ref", reference)])
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RepoError::FileNotFound {
                path: path.to_string(),
                reference: reference.to_string(),
            });
        }
        self.check(resp)
            .await?
            .text()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))
    }

    async fn list_changed_files(&self, commit_ref: &str) -> Result<Vec<String>, RepoError> {
        let resp = self
            .client
            .get(self.url(&format!("repository/commits/{}/diff", commit_ref)))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        let entries: Vec<DiffEntry> = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(entries.into_iter().map(|e| e.new_path).collect())
    }

    async fn create_branch(&self, name: &str, from_ref: &str) -> Result<(), RepoError> {
        let resp = self
            .client
            .post(self.url("repository/branches"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&CreateBranchRequest {
                branch: name,
                from_ref,
            })
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        self.check(resp).await?;
        Ok(())
    }

    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<String, RepoError> {
        let resp = self
            .client
            .post(self.url("repository/commits"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&CommitRequest {
                branch,
                commit_message: message,
                actions: vec![CommitAction {
                    action: "update",
                    file_path: path,
                    content,
                }],
            })
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        let commit: CommitResponse = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(commit.id)
    }

    async fn open_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<String, RepoError> {
        let resp = self
            .client
            .post(self.url("merge_requests"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&MergeRequestRequest {
                source_branch,
                target_branch,
                title,
                description,
            })
            .send()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        let mr: MergeRequestResponse = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| RepoError::Transport(e.to_string()))?;
        Ok(mr.web_url)
    }
}
