//! Shutdown flag, signal handling and the graceful stop escalation
//!
//! A running worker is stopped in up to four stages, each bounded:
//!
//! 1. Out-of-band shutdown request to the worker (skipped without a channel)
//! 2. Wait for it to exit on its own
//! 3. SIGTERM, then wait again
//! 4. SIGKILL, then reap
//!
//! The escalation stops at the first stage that sees the process exit.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use turbot_core::{GracefulStopConfig, Result, TurbotError};

use crate::process::{ProcessRunner, WaitStatus};

/// Process-wide "stop supervising" flag
///
/// Signal handlers only ever set it; the supervision loop reads it between
/// blocking steps. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Set `flag` on SIGTERM or SIGINT
///
/// The spawned task does nothing else; stopping the worker is left to the
/// supervision loop.
pub fn install_signal_handlers(flag: ShutdownFlag) -> Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = term.recv() => "SIGTERM",
                Some(()) = interrupt.recv() => "SIGINT",
                else => break,
            };
            info!("Received {}, shutting down", name);
            flag.trigger();
        }
    }))
}

/// Asks the worker to shut itself down
#[async_trait]
pub trait ShutdownChannel: Send + Sync {
    async fn request_shutdown(&self) -> Result<()>;
}

/// Shutdown request over HTTP: a POST carrying the shared secret in a header
#[derive(Debug, Clone)]
pub struct HttpShutdownChannel {
    client: reqwest::Client,
    url: String,
    header: String,
    secret: String,
}

impl HttpShutdownChannel {
    pub fn new(
        url: impl Into<String>,
        header: impl Into<String>,
        secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TurbotError::ShutdownRequest(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            header: header.into(),
            secret: secret.into(),
        })
    }
}

#[async_trait]
impl ShutdownChannel for HttpShutdownChannel {
    async fn request_shutdown(&self) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(self.header.as_str(), self.secret.as_str())
            .send()
            .await
            .map_err(|e| TurbotError::ShutdownRequest(format!("POST {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TurbotError::ShutdownRequest(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }
        Ok(())
    }
}

/// Shutdown channel for testing that counts requests
#[derive(Debug, Clone, Default)]
pub struct RecordingShutdownChannel {
    requests: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingShutdownChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose requests always fail
    pub fn failing() -> Self {
        Self {
            requests: Arc::new(AtomicUsize::new(0)),
            fail: true,
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShutdownChannel for RecordingShutdownChannel {
    async fn request_shutdown(&self) -> Result<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TurbotError::ShutdownRequest(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

/// Check a presented shutdown secret in constant time
///
/// An empty expected secret never matches.
pub fn verify_shutdown_secret(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Time allowed for each stage of the escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopBudget {
    pub request_timeout: Duration,
    pub natural_exit: Duration,
    pub terminate: Duration,
}

impl Default for StopBudget {
    fn default() -> Self {
        Self::from(&GracefulStopConfig::default())
    }
}

impl From<&GracefulStopConfig> for StopBudget {
    fn from(config: &GracefulStopConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout),
            natural_exit: Duration::from_secs(config.natural_exit),
            terminate: Duration::from_secs(config.terminate),
        }
    }
}

/// Stage at which the worker was seen to exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStage {
    /// Exited on its own (after the request, if one was sent)
    Natural,
    /// Exited after SIGTERM
    Terminated,
    /// Had to be killed
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether a shutdown request was sent
    pub requested: bool,
    pub stage: StopStage,
    pub exit_code: Option<i32>,
}

/// Stop a running worker, escalating until it is gone
///
/// Never fails: errors from individual stages are logged and the next stage
/// runs.
pub async fn graceful_stop<R: ProcessRunner>(
    runner: &R,
    handle: &mut R::Handle,
    channel: Option<&dyn ShutdownChannel>,
    budget: &StopBudget,
) -> StopOutcome {
    let requested = match channel {
        Some(channel) => {
            info!("Requesting worker shutdown");
            match tokio::time::timeout(budget.request_timeout, channel.request_shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Shutdown request failed: {}", e),
                Err(_) => warn!(
                    "Shutdown request timed out after {}s",
                    budget.request_timeout.as_secs()
                ),
            }
            true
        }
        None => false,
    };

    if let Some(code) = wait_for_exit(runner, handle, budget.natural_exit).await {
        info!("Worker exited cleanly");
        return StopOutcome {
            requested,
            stage: StopStage::Natural,
            exit_code: code,
        };
    }

    warn!(
        "Worker still running after {}s, sending SIGTERM",
        budget.natural_exit.as_secs()
    );
    if let Err(e) = runner.terminate(handle).await {
        warn!("SIGTERM failed: {}", e);
    }
    if let Some(code) = wait_for_exit(runner, handle, budget.terminate).await {
        return StopOutcome {
            requested,
            stage: StopStage::Terminated,
            exit_code: code,
        };
    }

    warn!("Worker ignored SIGTERM, killing");
    let exit_code = match runner.kill(handle).await {
        Ok(code) => code,
        Err(e) => {
            error!("Failed to kill worker: {}", e);
            None
        }
    };
    StopOutcome {
        requested,
        stage: StopStage::Killed,
        exit_code,
    }
}

/// `Some(exit code)` if the process exits within `timeout`
async fn wait_for_exit<R: ProcessRunner>(
    runner: &R,
    handle: &mut R::Handle,
    timeout: Duration,
) -> Option<Option<i32>> {
    match runner.wait_or_timeout(handle, timeout).await {
        Ok(WaitStatus::Exited(code)) => Some(code),
        Ok(WaitStatus::StillRunning) => None,
        Err(e) => {
            warn!("Wait on worker failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{LaunchSpec, MockProcessRunner, WorkerScript};

    fn spec() -> LaunchSpec {
        LaunchSpec::new("bot", vec![], "/mock")
    }

    fn budget() -> StopBudget {
        StopBudget {
            request_timeout: Duration::from_secs(5),
            natural_exit: Duration::from_secs(10),
            terminate: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn test_natural_exit_after_request() {
        let runner = MockProcessRunner::new(vec![WorkerScript::Exit {
            after: Duration::from_secs(4),
            code: 0,
        }]);
        let channel = RecordingShutdownChannel::new();
        let mut handle = runner.launch(&spec()).await.unwrap();

        let outcome = graceful_stop(&runner, &mut handle, Some(&channel), &budget()).await;

        assert_eq!(channel.requests(), 1);
        assert!(outcome.requested);
        assert_eq!(outcome.stage, StopStage::Natural);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(runner.terminations(), 0);
    }

    #[tokio::test]
    async fn test_no_channel_skips_request() {
        let runner = MockProcessRunner::new(vec![WorkerScript::RunForever { honors_term: true }]);
        let mut handle = runner.launch(&spec()).await.unwrap();

        let outcome = graceful_stop(&runner, &mut handle, None, &budget()).await;

        assert!(!outcome.requested);
        assert_eq!(outcome.stage, StopStage::Terminated);
        assert_eq!(runner.terminations(), 1);
        assert_eq!(runner.kills(), 0);
    }

    #[tokio::test]
    async fn test_failed_request_still_escalates() {
        let runner = MockProcessRunner::new(vec![WorkerScript::RunForever { honors_term: true }]);
        let channel = RecordingShutdownChannel::failing();
        let mut handle = runner.launch(&spec()).await.unwrap();

        let outcome = graceful_stop(&runner, &mut handle, Some(&channel), &budget()).await;

        assert!(outcome.requested);
        assert_eq!(outcome.stage, StopStage::Terminated);
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_killed() {
        let runner = MockProcessRunner::new(vec![WorkerScript::RunForever { honors_term: false }]);
        let mut handle = runner.launch(&spec()).await.unwrap();

        let outcome = graceful_stop(&runner, &mut handle, None, &budget()).await;

        assert_eq!(outcome.stage, StopStage::Killed);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(runner.terminations(), 1);
        assert_eq!(runner.kills(), 1);
    }

    #[tokio::test]
    async fn test_real_process_is_terminated() {
        use crate::process::TokioProcessRunner;

        let dir = tempfile::TempDir::new().unwrap();
        let runner = TokioProcessRunner::new();
        let spec = LaunchSpec::new(
            "sh",
            vec!["-c".to_string(), "sleep 30".to_string()],
            dir.path(),
        );
        let mut handle = runner.launch(&spec).await.unwrap();
        let budget = StopBudget {
            request_timeout: Duration::from_millis(100),
            natural_exit: Duration::from_millis(100),
            terminate: Duration::from_secs(5),
        };

        let outcome = graceful_stop(&runner, &mut handle, None, &budget).await;
        assert_eq!(outcome.stage, StopStage::Terminated);
    }

    #[test]
    fn test_verify_shutdown_secret() {
        assert!(verify_shutdown_secret("hunter2", "hunter2"));
        assert!(!verify_shutdown_secret("hunter3", "hunter2"));
        assert!(!verify_shutdown_secret("hunter", "hunter2"));
        assert!(!verify_shutdown_secret("", ""));
    }

    #[test]
    fn test_stop_budget_from_config() {
        let budget = StopBudget::default();
        assert_eq!(budget.natural_exit, Duration::from_secs(10));
        assert_eq!(budget.terminate, Duration::from_secs(3));
    }

    #[test]
    fn test_shutdown_flag_shared_between_clones() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_set());
        flag.trigger();
        assert!(clone.is_set());
    }
}
