//! Pull, install and rollback steps shared by both deploy entry points

use tracing::{error, info};
use turbot_core::Result;
use turbot_git::{GitExecutor, PackageInstaller, VersionControl};

pub struct DeployPipeline<E: GitExecutor, I: PackageInstaller> {
    vcs: VersionControl<E>,
    installer: I,
}

impl<E: GitExecutor, I: PackageInstaller> DeployPipeline<E, I> {
    pub fn new(vcs: VersionControl<E>, installer: I) -> Self {
        Self { vcs, installer }
    }

    pub async fn current_commit(&self) -> Result<String> {
        self.vcs.current_commit().await
    }

    /// Pull the deploy branch and install dependencies
    ///
    /// Returns the new HEAD commit.
    pub async fn update(&self) -> Result<String> {
        self.vcs.pull().await?;
        self.installer.install().await?;
        let commit = self.vcs.current_commit().await?;
        info!("Updated to {}", commit);
        Ok(commit)
    }

    /// Restore `good_commit` and reinstall its dependencies
    pub async fn rollback(&self, good_commit: &str) -> Result<()> {
        info!("Rolling back to {}", good_commit);
        self.vcs.restore(good_commit).await?;
        self.installer.install().await
    }

    /// [`rollback`](Self::rollback) that logs failure instead of returning it
    ///
    /// Returns whether the rollback completed.
    pub async fn rollback_logged(&self, good_commit: &str) -> bool {
        match self.rollback(good_commit).await {
            Ok(()) => true,
            Err(e) => {
                error!("Rollback to {} failed: {}", good_commit, e);
                false
            }
        }
    }
}
