//! The run / monitor / deploy / rollback loop

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use turbot_core::fail_open::{fail_open, fail_open_async};
use turbot_core::{short_commit, DeployOutcome, PathsConfig, Result, StatusChannel, TurbotConfig};
use turbot_git::{GitExecutor, PackageInstaller};

use crate::lock::{DeployLock, LockAttempt};
use crate::pipeline::DeployPipeline;
use crate::process::{LaunchSpec, ProcessRunner, SupervisionCycle, WaitStatus};
use crate::shutdown::{graceful_stop, ShutdownChannel, ShutdownFlag, StopBudget};
use crate::trigger::DeployTrigger;

/// Shortest slice used when polling a worker
const MIN_POLL: Duration = Duration::from_millis(1);

/// Settings for a [`DeploySupervisor`]
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker: LaunchSpec,
    pub deploy_signal: PathBuf,
    pub status_file: PathBuf,
    pub lock_file: PathBuf,
    /// A new version that exits inside this window is rolled back
    pub health_check: Duration,
    pub restart_backoff: Duration,
    /// Granularity at which the shutdown flag is noticed
    pub poll_interval: Duration,
    pub stop_budget: StopBudget,
}

impl SupervisorConfig {
    pub fn from_config(project_dir: &Path, config: &TurbotConfig) -> Self {
        let resolve = |path: &Path| PathsConfig::resolve(project_dir, path);

        Self {
            worker: LaunchSpec::new(
                config.worker.program.clone(),
                config.worker.args.clone(),
                project_dir,
            ),
            deploy_signal: resolve(&config.paths.deploy_signal),
            status_file: resolve(&config.paths.status_file),
            lock_file: resolve(&config.paths.lock_file),
            health_check: config.timeouts.health_check(),
            restart_backoff: config.timeouts.restart_backoff(),
            poll_interval: config.timeouts.poll_interval(),
            stop_budget: StopBudget::from(&config.graceful_stop),
        }
    }
}

/// What one pass through the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleReport {
    /// Shutdown was requested and the worker is gone
    Stopped,
    /// Worker exited with no deploy pending
    Restarted,
    /// A deploy was pending but the lock was unavailable; the signal is kept
    DeploySkipped,
    /// Pull or install failed and the pre-pull commit was restored
    PullFailed,
    /// The new version exited inside the health window and was rolled back
    RolledBack,
    /// The new version passed its health check and later exited
    Deployed,
}

enum WorkerExit {
    Exited,
    Stopped,
}

enum HealthCheck {
    Healthy,
    Crashed(Option<i32>),
    Stopped,
}

/// Keeps the worker running and deploys new code when signalled
///
/// Runs a single sequential loop. The only input from outside the loop is
/// the [`ShutdownFlag`], which signal handlers set.
pub struct DeploySupervisor<R, E, I>
where
    R: ProcessRunner,
    E: GitExecutor,
    I: PackageInstaller,
{
    config: SupervisorConfig,
    runner: R,
    pipeline: DeployPipeline<E, I>,
    status: StatusChannel,
    trigger: DeployTrigger,
    shutdown: ShutdownFlag,
    shutdown_channel: Option<Box<dyn ShutdownChannel>>,
    last_known_good: Option<String>,
    first_boot: bool,
    cycle: Option<SupervisionCycle>,
}

impl<R, E, I> DeploySupervisor<R, E, I>
where
    R: ProcessRunner,
    E: GitExecutor,
    I: PackageInstaller,
{
    pub fn new(
        config: SupervisorConfig,
        runner: R,
        pipeline: DeployPipeline<E, I>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let status = StatusChannel::new(&config.status_file);
        let trigger = DeployTrigger::new(&config.deploy_signal);

        Self {
            config,
            runner,
            pipeline,
            status,
            trigger,
            shutdown,
            shutdown_channel: None,
            last_known_good: None,
            first_boot: true,
            cycle: None,
        }
    }

    /// Ask the worker to exit over `channel` before signalling it
    pub fn with_shutdown_channel(mut self, channel: Box<dyn ShutdownChannel>) -> Self {
        self.shutdown_channel = Some(channel);
        self
    }

    /// Last commit that passed a health check, or the boot commit
    pub fn last_known_good(&self) -> Option<&str> {
        self.last_known_good.as_deref()
    }

    /// The most recent worker run
    pub fn current_cycle(&self) -> Option<&SupervisionCycle> {
        self.cycle.as_ref()
    }

    /// Supervise until the shutdown flag is set
    ///
    /// Returns an error only if the worker cannot be started.
    pub async fn run(&mut self) -> Result<()> {
        self.last_known_good =
            fail_open_async("read boot commit", || self.pipeline.current_commit()).await;
        info!(
            "Supervisor started at commit {}",
            self.last_known_good
                .as_deref()
                .map(short_commit)
                .unwrap_or("unknown")
        );

        while !self.shutdown.is_set() {
            let report = self.run_cycle().await?;
            debug!("Supervision cycle finished: {:?}", report);
        }

        info!("Supervisor exiting");
        Ok(())
    }

    /// Launch the worker once and handle whatever follows its exit
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        if !self.first_boot && !self.status.has_pending() {
            self.write_status(&DeployOutcome::Restart);
        }
        self.first_boot = false;

        let mut handle = self.launch_worker().await?;
        if let WorkerExit::Stopped = self.watch(&mut handle).await? {
            return Ok(CycleReport::Stopped);
        }
        if self.shutdown.is_set() {
            return Ok(CycleReport::Stopped);
        }

        if !self.trigger.is_pending() {
            info!(
                "No deploy pending, restarting worker in {}s",
                self.config.restart_backoff.as_secs()
            );
            self.backoff().await;
            return Ok(CycleReport::Restarted);
        }

        let lock = match DeployLock::try_acquire(&self.config.lock_file) {
            Ok(LockAttempt::Acquired(lock)) => lock,
            Ok(LockAttempt::Contended) => {
                warn!("Another deploy is already running, restarting worker without deploying");
                self.backoff().await;
                return Ok(CycleReport::DeploySkipped);
            }
            Err(e) => {
                error!("Deploy skipped: {}", e);
                self.backoff().await;
                return Ok(CycleReport::DeploySkipped);
            }
        };

        self.deploy(lock).await
    }

    async fn deploy(&mut self, lock: DeployLock) -> Result<CycleReport> {
        info!("Deploy signal detected, deploying");

        // Rollback target, captured before anything mutates the tree
        let good_commit = match self.pipeline.current_commit().await {
            Ok(commit) => commit,
            Err(e) => {
                error!("Cannot read current commit, deploy aborted: {}", e);
                self.clear_trigger();
                let good_commit = self
                    .last_known_good
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                self.write_status(&DeployOutcome::DeployPullFailed {
                    error: e.to_string(),
                    good_commit,
                });
                return Ok(CycleReport::PullFailed);
            }
        };

        self.clear_trigger();
        let new_commit = match self.pipeline.update().await {
            Ok(commit) => commit,
            Err(e) => {
                error!("Deploy failed: {}", e);
                self.pipeline.rollback_logged(&good_commit).await;
                self.write_status(&DeployOutcome::DeployPullFailed {
                    error: e.to_string(),
                    good_commit,
                });
                return Ok(CycleReport::PullFailed);
            }
        };

        info!(
            "Pulled {} (was {}), starting health check",
            short_commit(&new_commit),
            short_commit(&good_commit)
        );
        self.write_status(&DeployOutcome::DeploySuccess {
            commit: new_commit.clone(),
        });

        let mut handle = self.launch_worker().await?;
        match self.health_check(&mut handle).await? {
            HealthCheck::Stopped => Ok(CycleReport::Stopped),
            HealthCheck::Crashed(code) => {
                warn!(
                    "Worker exited with {:?} inside the {}s health window, rolling back",
                    code,
                    self.config.health_check.as_secs()
                );
                self.pipeline.rollback_logged(&good_commit).await;
                self.write_status(&DeployOutcome::Rollback {
                    bad_commit: new_commit,
                    good_commit,
                });
                Ok(CycleReport::RolledBack)
            }
            HealthCheck::Healthy => {
                info!("Health check passed, {} is now live", short_commit(&new_commit));
                self.last_known_good = Some(new_commit);
                drop(lock);

                match self.watch(&mut handle).await? {
                    WorkerExit::Stopped => Ok(CycleReport::Stopped),
                    WorkerExit::Exited => Ok(CycleReport::Deployed),
                }
            }
        }
    }

    async fn launch_worker(&mut self) -> Result<R::Handle> {
        let handle = self.runner.launch(&self.config.worker).await?;
        self.cycle = Some(SupervisionCycle::begin(self.runner.pid(&handle)));
        Ok(handle)
    }

    /// Wait for the worker to exit, stopping it if shutdown is requested
    async fn watch(&mut self, handle: &mut R::Handle) -> Result<WorkerExit> {
        let slice = self.poll_slice();
        loop {
            if self.shutdown.is_set() {
                self.stop_worker(handle).await;
                return Ok(WorkerExit::Stopped);
            }
            if let WaitStatus::Exited(code) = self.runner.wait_or_timeout(handle, slice).await? {
                self.finish_cycle(code);
                return Ok(WorkerExit::Exited);
            }
        }
    }

    /// Watch a freshly deployed worker for the health window
    async fn health_check(&mut self, handle: &mut R::Handle) -> Result<HealthCheck> {
        let window = self.config.health_check;
        let mut waited = Duration::ZERO;

        while waited < window {
            if self.shutdown.is_set() {
                self.stop_worker(handle).await;
                return Ok(HealthCheck::Stopped);
            }
            let slice = self.poll_slice().min(window - waited);
            if let WaitStatus::Exited(code) = self.runner.wait_or_timeout(handle, slice).await? {
                self.finish_cycle(code);
                return Ok(HealthCheck::Crashed(code));
            }
            waited += slice;
        }
        Ok(HealthCheck::Healthy)
    }

    async fn stop_worker(&mut self, handle: &mut R::Handle) {
        info!("Shutdown requested, stopping worker");
        let outcome = graceful_stop(
            &self.runner,
            handle,
            self.shutdown_channel.as_deref(),
            &self.config.stop_budget,
        )
        .await;
        debug!("Worker stopped: {:?}", outcome);
        self.finish_cycle(outcome.exit_code);
    }

    fn finish_cycle(&mut self, exit_code: Option<i32>) {
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.finish(exit_code);
        }
    }

    /// Sleep the restart backoff, waking early on shutdown
    async fn backoff(&self) {
        let slice = self.poll_slice();
        let mut slept = Duration::ZERO;
        while slept < self.config.restart_backoff && !self.shutdown.is_set() {
            let step = slice.min(self.config.restart_backoff - slept);
            tokio::time::sleep(step).await;
            slept += step;
        }
    }

    fn poll_slice(&self) -> Duration {
        self.config.poll_interval.max(MIN_POLL)
    }

    fn clear_trigger(&self) {
        fail_open("clear deploy signal", || self.trigger.consume());
    }

    fn write_status(&self, outcome: &DeployOutcome) {
        fail_open("write status", || self.status.write(outcome));
    }
}
