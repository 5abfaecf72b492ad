// Fetching unit sources: the SourceFetcher seam and its git CLI implementation

use async_trait::async_trait;
use std::path::Path;

use crate::command;
use crate::error::RuntimeError;

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `branch` of `repository` (owner/name) into `dest`, pinned to `commit` when given.
    /// `dest` must not exist or be empty.
    async fn fetch(
        &self,
        repository: &str,
        branch: &str,
        commit: Option<&str>,
        dest: &Path,
    ) -> Result<(), RuntimeError>;
}

pub struct GitCli {
    base_url: String,
}

impl GitCli {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn clone_url(&self, repository: &str) -> String {
        if repository.contains("://") || repository.starts_with('/') {
            return repository.to_string();
        }
        format!(
            "{}/{}.git",
            self.base_url.trim_end_matches('/'),
            repository.trim_end_matches(".git")
        )
    }
}

#[async_trait]
impl SourceFetcher for GitCli {
    #[tracing::instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn fetch(
        &self,
        repository: &str,
        branch: &str,
        commit: Option<&str>,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        let url = self.clone_url(repository);
        let dest_arg = dest.to_string_lossy();
        command::run(
            "git",
            &["clone", "--depth", "1", "--branch", branch, &url, &dest_arg],
            None,
            &[],
        )
        .await?;

        if let Some(sha) = commit {
            let head = command::run("git", &["rev-parse", "HEAD"], Some(dest), &[]).await?;
            if head != sha {
                command::run("git", &["fetch", "--depth", "1", "origin", sha], Some(dest), &[])
                    .await?;
                command::run("git", &["checkout", "--detach", sha], Some(dest), &[]).await?;
            }
        }
        Ok(())
    }
}
