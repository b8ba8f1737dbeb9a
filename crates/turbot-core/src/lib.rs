//! # turbot-core
//!
//! Core types for the Turbot worker supervisor.
//!
//! The supervisor keeps a single worker process alive, pulls new code when a
//! deploy is requested, health-checks the result and rolls back on failure.
//! This crate holds the pieces every other crate shares:
//!
//! - `TurbotError` and the `Result` alias
//! - `TurbotConfig`, loaded from `.turbot/config.toml`
//! - `DeployOutcome`, the one-shot message handed to the next worker boot
//! - `StatusChannel`, the file mailbox that carries it

mod config;
mod error;
pub mod fail_open;
mod status;
mod types;

pub use config::{
    GitConfig, GracefulStopConfig, InstallConfig, PathsConfig, ServiceConfig, ShutdownConfig,
    TimeoutConfig, TurbotConfig, WorkerConfig, CONFIG_DIR, CONFIG_FILE,
};
pub use error::{Result, TurbotError};
pub use status::StatusChannel;
pub use types::{short_commit, DeployOutcome};
