//! Source repository seam: listing, content fetch, and the write primitives
//! the remediation executor uses (branch, commit, merge request).

pub mod gitlab;

pub use gitlab::GitLabClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RepoError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoFile {
    pub path: String,
    pub size: Option<u64>,
}

#[async_trait]
pub trait SourceRepoClient: Send + Sync {
    /// All files reachable at the given ref, in the provider's listing order.
    async fn list_files(&self, reference: &str) -> Result<Vec<RepoFile>, RepoError>;

    async fn get_file_content(&self, path: &str, reference: &str) -> Result<String, RepoError>;

    /// Paths touched by the given commit.
    async fn list_changed_files(&self, commit_ref: &str) -> Result<Vec<String>, RepoError>;

    async fn create_branch(&self, name: &str, from_ref: &str) -> Result<(), RepoError>;

    /// Commit one file's new content to a branch; returns the commit ref.
    async fn commit_file(
        &self,
        path: &str,
        content: &str,
        message: &str,
        branch: &str,
    ) -> Result<String, RepoError>;

    /// Returns a reference to the opened merge request (URL or id).
    async fn open_merge_request(
        &self,
        source_branch: &str,
        target_branch: &str,
        title: &str,
        description: &str,
    ) -> Result<String, RepoError>;
}
