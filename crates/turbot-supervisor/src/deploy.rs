//! One-shot deploy against a worker managed by the service manager
//!
//! Used when the worker runs as a systemd unit instead of under
//! [`DeploySupervisor`](crate::DeploySupervisor). Health is judged by the
//! unit's main PID staying the same across the health window.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, instrument, warn};
use turbot_core::fail_open::{fail_open, fail_open_async};
use turbot_core::{
    short_commit, DeployOutcome, PathsConfig, Result, StatusChannel, TurbotConfig, TurbotError,
};
use turbot_git::{GitExecutor, PackageInstaller};

use crate::lock::{DeployLock, LockAttempt};
use crate::pipeline::DeployPipeline;
use crate::trigger::DeployTrigger;

/// Controls the service the worker runs under (allows mocking in tests)
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn is_active(&self) -> Result<bool>;
    /// Main PID, `None` when the service is not running
    async fn main_pid(&self) -> Result<Option<u32>>;
}

/// A systemd user unit driven through `systemctl --user`
#[derive(Debug, Clone)]
pub struct SystemdUserService {
    unit: String,
    timeout: Duration,
}

impl SystemdUserService {
    pub fn new(unit: impl Into<String>, timeout: Duration) -> Self {
        Self {
            unit: unit.into(),
            timeout,
        }
    }

    #[instrument(skip(self), fields(unit = %self.unit))]
    async fn systemctl(&self, args: &[&str]) -> Result<std::process::Output> {
        let mut command = Command::new("systemctl");
        command.arg("--user").args(args).arg(&self.unit).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output
                .map_err(|e| TurbotError::Service(format!("Failed to run systemctl: {}", e))),
            Err(_) => Err(TurbotError::Timeout {
                command: format!("systemctl --user {} {}", args.join(" "), self.unit),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn checked(&self, action: &str) -> Result<()> {
        let output = self.systemctl(&[action]).await?;
        if !output.status.success() {
            return Err(TurbotError::Service(format!(
                "systemctl --user {} {} failed: {}",
                action,
                self.unit,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceControl for SystemdUserService {
    async fn start(&self) -> Result<()> {
        self.checked("start").await
    }

    async fn stop(&self) -> Result<()> {
        self.checked("stop").await
    }

    async fn is_active(&self) -> Result<bool> {
        // Non-zero exit just means "not active"
        let output = self.systemctl(&["is-active"]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "active")
    }

    async fn main_pid(&self) -> Result<Option<u32>> {
        let output = self
            .systemctl(&["show", "--property=MainPID", "--value"])
            .await?;
        let raw = String::from_utf8_lossy(&output.stdout);
        let pid = raw.trim().parse::<u32>().map_err(|e| {
            TurbotError::Service(format!("Unexpected MainPID {:?}: {}", raw.trim(), e))
        })?;
        Ok((pid != 0).then_some(pid))
    }
}

#[derive(Debug, Default)]
struct MockServiceState {
    pids: VecDeque<Option<u32>>,
    active: bool,
    calls: Vec<String>,
}

/// Mock service for testing
///
/// `main_pid` replays the scripted PIDs in order and then keeps returning
/// the last one. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockServiceControl {
    state: Arc<Mutex<MockServiceState>>,
    fail_stop: bool,
}

impl MockServiceControl {
    /// Healthy service whose PID never changes
    pub fn new() -> Self {
        Self::with_pids(vec![Some(4242)])
    }

    pub fn with_pids(pids: Vec<Option<u32>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockServiceState {
                pids: pids.into_iter().collect(),
                active: true,
                calls: Vec::new(),
            })),
            fail_stop: false,
        }
    }

    /// Service that reports inactive after every start
    pub fn inactive(self) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.active = false;
        }
        self
    }

    pub fn failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Every start/stop issued so far
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(call.to_string());
        }
    }
}

#[async_trait]
impl ServiceControl for MockServiceControl {
    async fn start(&self) -> Result<()> {
        self.record("start");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop");
        if self.fail_stop {
            return Err(TurbotError::Service("unit not loaded".to_string()));
        }
        Ok(())
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.state.lock().map(|s| s.active).unwrap_or(false))
    }

    async fn main_pid(&self) -> Result<Option<u32>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TurbotError::Other("mock service poisoned".to_string()))?;
        let pid = if state.pids.len() > 1 {
            state.pids.pop_front().flatten()
        } else {
            state.pids.front().copied().flatten()
        };
        Ok(pid)
    }
}

/// Result of a standalone deploy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StandaloneOutcome {
    /// Another deploy held the lock; nothing was touched
    Skipped,
    Deployed { commit: String },
    PullFailed { error: String, good_commit: String },
    RolledBack { bad_commit: String, good_commit: String },
}

impl StandaloneOutcome {
    /// 0 when deployed or skipped, 1 when a failure was rolled back
    pub fn exit_code(&self) -> i32 {
        match self {
            StandaloneOutcome::Skipped | StandaloneOutcome::Deployed { .. } => 0,
            StandaloneOutcome::PullFailed { .. } | StandaloneOutcome::RolledBack { .. } => 1,
        }
    }
}

/// Timing and file settings for a [`StandaloneDeploy`]
#[derive(Debug, Clone)]
pub struct StandaloneConfig {
    pub lock_file: PathBuf,
    pub status_file: PathBuf,
    /// Sentinel cleared once this deploy holds the lock
    pub deploy_signal: PathBuf,
    /// Delay after starting the service before sampling its PID
    pub settle: Duration,
    pub health_check: Duration,
}

impl StandaloneConfig {
    pub fn from_config(project_dir: &Path, config: &TurbotConfig) -> Self {
        Self {
            lock_file: PathsConfig::resolve(project_dir, &config.paths.lock_file),
            status_file: PathsConfig::resolve(project_dir, &config.paths.status_file),
            deploy_signal: PathsConfig::resolve(project_dir, &config.paths.deploy_signal),
            settle: Duration::from_secs(config.service.settle),
            health_check: config.timeouts.health_check(),
        }
    }
}

pub struct StandaloneDeploy<E, I, S>
where
    E: GitExecutor,
    I: PackageInstaller,
    S: ServiceControl,
{
    config: StandaloneConfig,
    pipeline: DeployPipeline<E, I>,
    service: S,
    status: StatusChannel,
}

impl<E, I, S> StandaloneDeploy<E, I, S>
where
    E: GitExecutor,
    I: PackageInstaller,
    S: ServiceControl,
{
    pub fn new(config: StandaloneConfig, pipeline: DeployPipeline<E, I>, service: S) -> Self {
        let status = StatusChannel::new(&config.status_file);
        Self {
            config,
            pipeline,
            service,
            status,
        }
    }

    /// Run one deploy under the deploy lock
    ///
    /// Pipeline and health failures are rolled back and reported through
    /// the outcome. Errors are returned only when the lock file cannot be
    /// used or the pre-deploy commit cannot be read.
    pub async fn run(&self) -> Result<StandaloneOutcome> {
        let _lock = match DeployLock::try_acquire(&self.config.lock_file)? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::Contended => {
                info!("Another deploy is already running, skipping");
                return Ok(StandaloneOutcome::Skipped);
            }
        };

        info!("Deploy started");
        // A pending request is satisfied by this deploy
        let trigger = DeployTrigger::new(&self.config.deploy_signal);
        fail_open("clear deploy signal", || trigger.consume());

        let good_commit = self.pipeline.current_commit().await?;
        info!("Current commit: {}", short_commit(&good_commit));

        if let Err(e) = self.service.stop().await {
            warn!("Stopping service failed (may already be stopped): {}", e);
        }

        let new_commit = match self.pipeline.update().await {
            Ok(commit) => commit,
            Err(e) => {
                error!("Deploy failed: {}", e);
                self.pipeline.rollback_logged(&good_commit).await;
                self.write_status(&DeployOutcome::DeployPullFailed {
                    error: e.to_string(),
                    good_commit: good_commit.clone(),
                });
                self.start_service().await;
                return Ok(StandaloneOutcome::PullFailed {
                    error: e.to_string(),
                    good_commit,
                });
            }
        };

        self.write_status(&DeployOutcome::DeploySuccess {
            commit: new_commit.clone(),
        });
        self.start_service().await;

        tokio::time::sleep(self.config.settle).await;
        let start_pid = self.main_pid().await;
        info!(
            "Service started (pid {:?}), watching for {}s",
            start_pid,
            self.config.health_check.as_secs()
        );

        tokio::time::sleep(self.config.health_check).await;
        let current_pid = self.main_pid().await;
        let active = self.service.is_active().await.unwrap_or(false);

        if start_pid.is_none() || start_pid != current_pid || !active {
            warn!(
                "Service failed health check (pid {:?} -> {:?}, active: {}), rolling back",
                start_pid, current_pid, active
            );
            fail_open_async("stop service", || self.service.stop()).await;
            self.pipeline.rollback_logged(&good_commit).await;
            self.write_status(&DeployOutcome::Rollback {
                bad_commit: new_commit.clone(),
                good_commit: good_commit.clone(),
            });
            self.start_service().await;
            return Ok(StandaloneOutcome::RolledBack {
                bad_commit: new_commit,
                good_commit,
            });
        }

        info!(
            "Deploy successful, {} healthy after {}s",
            short_commit(&new_commit),
            self.config.health_check.as_secs()
        );
        Ok(StandaloneOutcome::Deployed { commit: new_commit })
    }

    async fn start_service(&self) {
        fail_open_async("start service", || self.service.start()).await;
    }

    async fn main_pid(&self) -> Option<u32> {
        fail_open_async("read service pid", || self.service.main_pid())
            .await
            .flatten()
    }

    fn write_status(&self, outcome: &DeployOutcome) {
        fail_open("write status", || self.status.write(outcome));
    }
}
