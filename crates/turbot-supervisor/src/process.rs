//! Worker process lifecycle: launch, bounded waits, termination

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use turbot_core::{Result, TurbotError};

use crate::shutdown::ShutdownFlag;

/// How to start a process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Start in its own process group with null stdio so it outlives us
    pub detached: bool,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            detached: false,
        }
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    /// Command line for log messages
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a bounded wait on a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Exited with this code (`None` when killed by a signal)
    Exited(Option<i32>),
    StillRunning,
}

/// Owns the lifecycle of child processes (allows mocking in tests)
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    type Handle: Send;

    /// Start a process. Failure to start is returned as `TurbotError::Launch`.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Self::Handle>;

    /// Wait up to `timeout` for the process to exit, without killing it
    async fn wait_or_timeout(&self, handle: &mut Self::Handle, timeout: Duration)
        -> Result<WaitStatus>;

    /// Ask the process to terminate (SIGTERM)
    async fn terminate(&self, handle: &mut Self::Handle) -> Result<()>;

    /// Force-kill the process and block until the OS reports it gone
    async fn kill(&self, handle: &mut Self::Handle) -> Result<Option<i32>>;

    fn pid(&self, handle: &Self::Handle) -> Option<u32>;
}

/// Handle to a process started by [`TokioProcessRunner`]
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
}

/// Real process runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    type Handle = WorkerHandle;

    async fn launch(&self, spec: &LaunchSpec) -> Result<WorkerHandle> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args).current_dir(&spec.working_dir);

        if spec.detached {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .process_group(0);
        } else {
            // Never leave the worker running if the supervisor itself dies
            command.kill_on_drop(true);
        }

        let child = command.spawn().map_err(|e| {
            TurbotError::Launch(format!("Failed to start {}: {}", spec.display(), e))
        })?;
        let pid = child.id();
        debug!("Launched {} (pid {:?})", spec.display(), pid);

        Ok(WorkerHandle { child, pid })
    }

    async fn wait_or_timeout(
        &self,
        handle: &mut WorkerHandle,
        timeout: Duration,
    ) -> Result<WaitStatus> {
        match tokio::time::timeout(timeout, handle.child.wait()).await {
            Ok(status) => {
                let status = status
                    .map_err(|e| TurbotError::Process(format!("Failed to wait for worker: {}", e)))?;
                Ok(WaitStatus::Exited(status.code()))
            }
            Err(_) => Ok(WaitStatus::StillRunning),
        }
    }

    async fn terminate(&self, handle: &mut WorkerHandle) -> Result<()> {
        if handle.child.try_wait()?.is_some() {
            return Ok(());
        }
        let pid = match handle.pid {
            Some(pid) => pid,
            None => return Ok(()),
        };

        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await
            .map_err(|e| TurbotError::Process(format!("Failed to send SIGTERM to {}: {}", pid, e)))?;

        if !status.success() {
            return Err(TurbotError::Process(format!(
                "kill -TERM {} exited with {}",
                pid, status
            )));
        }
        Ok(())
    }

    async fn kill(&self, handle: &mut WorkerHandle) -> Result<Option<i32>> {
        if let Some(status) = handle.child.try_wait()? {
            return Ok(status.code());
        }

        handle
            .child
            .kill()
            .await
            .map_err(|e| TurbotError::Process(format!("Failed to kill worker: {}", e)))?;

        let status = handle
            .child
            .wait()
            .await
            .map_err(|e| TurbotError::Process(format!("Failed to reap worker: {}", e)))?;
        Ok(status.code())
    }

    fn pid(&self, handle: &WorkerHandle) -> Option<u32> {
        handle.pid
    }
}

/// Scripted behaviour of one mock worker launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerScript {
    /// Exits with `code` after `after` of simulated runtime
    Exit { after: Duration, code: i32 },
    /// Runs until stopped; exits on SIGTERM only if `honors_term`
    RunForever { honors_term: bool },
    /// The launch itself fails
    FailLaunch,
}

impl WorkerScript {
    /// Exits immediately with `code`
    pub fn crash(code: i32) -> Self {
        WorkerScript::Exit {
            after: Duration::ZERO,
            code,
        }
    }
}

/// Handle to a mock worker
#[derive(Debug)]
pub struct MockHandle {
    id: u32,
    /// Simulated runtime left; `None` runs forever
    remaining: Option<Duration>,
    code: i32,
    honors_term: bool,
    exited: Option<Option<i32>>,
}

#[derive(Debug, Default)]
struct MockState {
    scripts: VecDeque<WorkerScript>,
    launches: Vec<LaunchSpec>,
    terminations: usize,
    kills: usize,
    stop_after: Option<(usize, ShutdownFlag)>,
}

/// Mock process runner for testing
///
/// Each launch takes the next [`WorkerScript`]; once the scripts run out,
/// workers exit immediately with code 0. Waits advance simulated time
/// instead of sleeping. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockProcessRunner {
    state: Arc<Mutex<MockState>>,
}

impl MockProcessRunner {
    pub fn new(scripts: Vec<WorkerScript>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                scripts: scripts.into_iter().collect(),
                ..Default::default()
            })),
        }
    }

    /// Trigger `flag` when the `launches`-th worker starts
    pub fn stop_after_launches(self, launches: usize, flag: ShutdownFlag) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.stop_after = Some((launches, flag));
        }
        self
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.with_state(|s| s.launches.clone())
    }

    pub fn terminations(&self) -> usize {
        self.with_state(|s| s.terminations)
    }

    pub fn kills(&self) -> usize {
        self.with_state(|s| s.kills)
    }

    fn with_state<T: Default>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        self.state.lock().map(|mut s| f(&mut s)).unwrap_or_default()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    type Handle = MockHandle;

    async fn launch(&self, spec: &LaunchSpec) -> Result<MockHandle> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TurbotError::Other("mock runner poisoned".to_string()))?;

        state.launches.push(spec.clone());
        let launch_count = state.launches.len();
        if let Some((after, flag)) = &state.stop_after {
            if launch_count >= *after {
                flag.trigger();
            }
        }

        let script = state
            .scripts
            .pop_front()
            .unwrap_or(WorkerScript::crash(0));
        let id = launch_count as u32;

        match script {
            WorkerScript::FailLaunch => Err(TurbotError::Launch(format!(
                "Failed to start {}: mock launch failure",
                spec.display()
            ))),
            WorkerScript::Exit { after, code } => Ok(MockHandle {
                id,
                remaining: Some(after),
                code,
                honors_term: true,
                exited: None,
            }),
            WorkerScript::RunForever { honors_term } => Ok(MockHandle {
                id,
                remaining: None,
                code: 0,
                honors_term,
                exited: None,
            }),
        }
    }

    async fn wait_or_timeout(
        &self,
        handle: &mut MockHandle,
        timeout: Duration,
    ) -> Result<WaitStatus> {
        if let Some(code) = handle.exited {
            return Ok(WaitStatus::Exited(code));
        }
        match handle.remaining {
            Some(left) if left <= timeout => {
                handle.remaining = Some(Duration::ZERO);
                handle.exited = Some(Some(handle.code));
                Ok(WaitStatus::Exited(Some(handle.code)))
            }
            Some(left) => {
                handle.remaining = Some(left - timeout);
                Ok(WaitStatus::StillRunning)
            }
            None => Ok(WaitStatus::StillRunning),
        }
    }

    async fn terminate(&self, handle: &mut MockHandle) -> Result<()> {
        self.with_state(|s| s.terminations += 1);
        if handle.exited.is_none() && handle.honors_term {
            handle.exited = Some(None);
        }
        Ok(())
    }

    async fn kill(&self, handle: &mut MockHandle) -> Result<Option<i32>> {
        self.with_state(|s| s.kills += 1);
        let code = *handle.exited.get_or_insert(None);
        Ok(code)
    }

    fn pid(&self, handle: &MockHandle) -> Option<u32> {
        Some(10_000 + handle.id)
    }
}

/// One run of the worker process
#[derive(Debug, Clone)]
pub struct SupervisionCycle {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    started: Instant,
}

impl SupervisionCycle {
    pub fn begin(pid: Option<u32>) -> Self {
        info!("Worker started (pid {:?})", pid);
        Self {
            started_at: chrono::Utc::now(),
            pid,
            exit_code: None,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the exit and log how long the worker ran
    pub fn finish(&mut self, exit_code: Option<i32>) {
        self.exit_code = exit_code;
        let elapsed = self.elapsed().as_secs_f64();
        match exit_code {
            Some(code) => info!("Worker exited with code {} after {:.1}s", code, elapsed),
            None => warn!("Worker killed by signal after {:.1}s", elapsed),
        }
    }
}
