//! Deploy outcome types shared by the supervisor and the worker

use serde::{Deserialize, Serialize};

/// Outcome of a deploy attempt or restart, handed to the next worker boot.
///
/// Serialized as a flat JSON object tagged by `event`:
///
/// ```json
/// {"event": "rollback", "bad_commit": "9f1c...", "good_commit": "a41b..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DeployOutcome {
    /// New code pulled and the worker is being started on it
    DeploySuccess { commit: String },
    /// The new commit crashed inside the health-check window
    Rollback {
        bad_commit: String,
        good_commit: String,
    },
    /// Pull or install failed before the worker was restarted
    DeployPullFailed { error: String, good_commit: String },
    /// Worker restarted after an unexpected exit
    Restart,
}

impl DeployOutcome {
    /// Event name as written to the mailbox
    pub fn event(&self) -> &'static str {
        match self {
            DeployOutcome::DeploySuccess { .. } => "deploy_success",
            DeployOutcome::Rollback { .. } => "rollback",
            DeployOutcome::DeployPullFailed { .. } => "deploy_pull_failed",
            DeployOutcome::Restart => "restart",
        }
    }

    /// Operator-facing announcement for this outcome
    pub fn announcement(&self) -> String {
        match self {
            DeployOutcome::DeploySuccess { commit } => {
                format!("Deploy successful: now running {}", short_commit(commit))
            }
            DeployOutcome::Rollback {
                bad_commit,
                good_commit,
            } => format!(
                "Rolled back: commit {} crashed during its health check. Reverted to {}",
                short_commit(bad_commit),
                short_commit(good_commit)
            ),
            DeployOutcome::DeployPullFailed { error, good_commit } => format!(
                "Deploy failed during pull/install: {}. Rolled back to {}",
                error,
                short_commit(good_commit)
            ),
            DeployOutcome::Restart => "Restarted after an unexpected crash".to_string(),
        }
    }
}

/// First 8 characters of a commit hash (the whole string if shorter)
pub fn short_commit(commit: &str) -> &str {
    match commit.char_indices().nth(8) {
        Some((idx, _)) => &commit[..idx],
        None => commit,
    }
}
