//! # turbot-supervisor
//!
//! Keeps the worker process running and deploys new code into it.
//!
//! This crate provides:
//! - `ProcessRunner` with a tokio implementation and a scripted mock
//! - The graceful stop escalation and the signal-driven shutdown flag
//! - The exclusive deploy lock and the deploy trigger sentinel
//! - `DeploySupervisor`, the run / deploy / health-check / rollback loop
//! - `StandaloneDeploy`, the one-shot deploy for service-managed workers

mod deploy;
mod lock;
mod pipeline;
mod process;
mod shutdown;
mod supervisor;
mod trigger;

pub use deploy::{
    MockServiceControl, ServiceControl, StandaloneConfig, StandaloneDeploy, StandaloneOutcome,
    SystemdUserService,
};
pub use lock::{DeployLock, LockAttempt};
pub use pipeline::DeployPipeline;
pub use process::{
    LaunchSpec, MockHandle, MockProcessRunner, ProcessRunner, SupervisionCycle,
    TokioProcessRunner, WaitStatus, WorkerHandle, WorkerScript,
};
pub use shutdown::{
    graceful_stop, install_signal_handlers, verify_shutdown_secret, HttpShutdownChannel,
    RecordingShutdownChannel, ShutdownChannel, ShutdownFlag, StopBudget, StopOutcome, StopStage,
};
pub use supervisor::{CycleReport, DeploySupervisor, SupervisorConfig};
pub use trigger::DeployTrigger;
