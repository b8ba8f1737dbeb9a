//! Git command execution abstraction

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, instrument};
use turbot_core::{Result, TurbotError};

/// Output from a git command
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl GitOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Failed output with the given stderr
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }
}

impl From<Output> for GitOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait GitExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<GitOutput>;
}

/// Run `command` to completion, killing it if it outlives `timeout`
pub(crate) async fn output_with_timeout(
    command: &mut Command,
    timeout: Duration,
    label: &str,
) -> Result<Output> {
    command.stdin(Stdio::null()).kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(output) => Ok(output?),
        Err(_) => Err(TurbotError::Timeout {
            command: label.to_string(),
            secs: timeout.as_secs(),
        }),
    }
}

/// Real git command executor
#[derive(Debug, Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
    timeout: Duration,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            timeout,
        }
    }
}

#[async_trait]
impl GitExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        debug!("Executing git {:?}", args);

        let label = format!("git {}", args.join(" "));
        let output = output_with_timeout(
            Command::new("git").args(args).current_dir(&self.repo_root),
            self.timeout,
            &label,
        )
        .await
        .map_err(|e| match e {
            TurbotError::Io(io) => TurbotError::GitCommand(format!("Failed to execute git: {}", io)),
            other => other,
        })?;

        let git_output = GitOutput::from(output);

        if !git_output.success {
            debug!("Git command failed: {}", git_output.stderr);
        }

        Ok(git_output)
    }
}

/// Mock git executor for testing
///
/// Responses are keyed by the space-joined arguments. A key registered with
/// several responses replays them in order and then keeps returning the
/// last one. Clones share the call log.
#[derive(Clone)]
pub struct MockGitExecutor {
    responses: Arc<Mutex<HashMap<String, VecDeque<GitOutput>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Default for MockGitExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGitExecutor {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_response(self, command: &str, output: GitOutput) -> Self {
        self.with_sequence(command, vec![output])
    }

    pub fn with_sequence(self, command: &str, outputs: Vec<GitOutput>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(command.to_string(), outputs.into_iter().collect());
        }
        self
    }

    /// Every command executed so far, as space-joined arguments
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GitExecutor for MockGitExecutor {
    async fn exec(&self, args: &[&str]) -> Result<GitOutput> {
        let key = args.join(" ");
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(key.clone());
        }

        let mut responses = self
            .responses
            .lock()
            .map_err(|_| TurbotError::Other("mock response table poisoned".to_string()))?;
        let queue = responses
            .get_mut(&key)
            .ok_or_else(|| TurbotError::GitCommand(format!("No mock response for: {}", key)))?;

        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        output.ok_or_else(|| TurbotError::GitCommand(format!("No mock response for: {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor() {
        let executor = MockGitExecutor::new().with_response("rev-parse HEAD", GitOutput::ok("abc\n"));

        let output = executor.exec(&["rev-parse", "HEAD"]).await.unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "abc\n");
        assert_eq!(executor.calls(), vec!["rev-parse HEAD".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_sequence_repeats_last() {
        let executor = MockGitExecutor::new().with_sequence(
            "rev-parse HEAD",
            vec![GitOutput::ok("old"), GitOutput::ok("new")],
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(executor.exec(&["rev-parse", "HEAD"]).await.unwrap().stdout);
        }
        assert_eq!(seen, vec!["old", "new", "new"]);
    }

    #[tokio::test]
    async fn test_mock_unknown_command_errors() {
        let executor = MockGitExecutor::new();
        let result = executor.exec(&["status"]).await;
        assert!(matches!(result, Err(TurbotError::GitCommand(_))));
        assert_eq!(executor.calls(), vec!["status".to_string()]);
    }

    #[tokio::test]
    async fn test_timeout_kills_slow_command() {
        let result = output_with_timeout(
            Command::new("sleep").arg("5"),
            Duration::from_millis(50),
            "sleep 5",
        )
        .await;

        match result {
            Err(TurbotError::Timeout { command, .. }) => assert_eq!(command, "sleep 5"),
            other => panic!("expected timeout, got {:?}", other.map(|o| o.status)),
        }
    }
}
