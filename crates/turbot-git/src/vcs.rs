//! Version control operations used by the deploy pipeline

use tracing::{debug, info};
use turbot_core::{Result, TurbotError};

use crate::GitExecutor;

/// Git operations against the project working tree
///
/// Every mutating operation maps a non-zero git exit to
/// `TurbotError::GitCommand` carrying git's stderr.
pub struct VersionControl<E: GitExecutor> {
    executor: E,
    remote: String,
    branch: String,
}

impl<E: GitExecutor> VersionControl<E> {
    /// Create a version control handle deploying `branch` from `remote`
    pub fn new(executor: E, remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            executor,
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    /// Get the current HEAD commit hash
    pub async fn current_commit(&self) -> Result<String> {
        let output = self.run(&["rev-parse", "HEAD"]).await?;
        let commit = output.trim().to_string();
        if commit.is_empty() {
            return Err(TurbotError::GitCommand(
                "rev-parse HEAD returned no commit".to_string(),
            ));
        }
        debug!("Current commit: {}", commit);
        Ok(commit)
    }

    /// Pull the deploy branch from the remote
    pub async fn pull(&self) -> Result<()> {
        info!("Pulling {} {}", self.remote, self.branch);
        self.run(&["pull", self.remote.as_str(), self.branch.as_str()])
            .await
            .map(|_| ())
    }

    /// Put the working tree back on `commit`
    ///
    /// Checks out the deploy branch first so HEAD stays attached, then hard
    /// resets it. A half-finished pull (conflicts, partial update) is
    /// discarded by the reset.
    pub async fn restore(&self, commit: &str) -> Result<()> {
        info!("Restoring working tree to {}", commit);
        self.run(&["checkout", self.branch.as_str()]).await?;
        self.run(&["reset", "--hard", commit]).await?;
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.executor.exec(args).await?;
        if !output.success {
            return Err(TurbotError::GitCommand(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}
