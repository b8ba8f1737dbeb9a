//! Configuration management for Turbot
//!
//! Project-level settings for the supervisor: how to launch the worker, where
//! the mailbox/sentinel/lock files live, the deploy timeouts, the git remote
//! and the dependency install command.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, TurbotError};

/// Directory holding the project configuration
pub const CONFIG_DIR: &str = ".turbot";

/// Configuration file name inside `CONFIG_DIR`
pub const CONFIG_FILE: &str = "config.toml";

/// Project-level Turbot configuration
///
/// Loaded from `.turbot/config.toml` in the project root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurbotConfig {
    /// Worker process to supervise
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Mailbox, sentinel, lock and log file locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Deploy and supervision timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Graceful stop escalation budget
    #[serde(default)]
    pub graceful_stop: GracefulStopConfig,

    /// Remote and branch to deploy from
    #[serde(default)]
    pub git: GitConfig,

    /// Dependency install command
    #[serde(default)]
    pub install: InstallConfig,

    /// Out-of-band shutdown request to the worker
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Service unit used by the standalone deploy
    #[serde(default)]
    pub service: ServiceConfig,
}

/// Worker process command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_program")]
    pub program: String,

    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
}

/// File locations, relative to the project root unless absolute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Presence requests a deploy
    #[serde(default = "default_deploy_signal")]
    pub deploy_signal: PathBuf,

    /// One-shot status mailbox
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,

    /// Exclusive deploy lock
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    #[serde(default = "default_supervisor_log")]
    pub supervisor_log: PathBuf,

    #[serde(default = "default_deploy_log")]
    pub deploy_log: PathBuf,

    /// Log files are rotated once they reach this size
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,
}

/// Timeouts in seconds unless noted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// A worker that exits sooner than this after a deploy is a bad deploy
    #[serde(default = "default_health_check")]
    pub health_check: u64,

    #[serde(default = "default_git_timeout")]
    pub git: u64,

    #[serde(default = "default_install_timeout")]
    pub install: u64,

    /// Delay before restarting a worker that exited without a deploy
    #[serde(default = "default_restart_backoff")]
    pub restart_backoff: u64,

    /// How often the supervisor checks the shutdown flag while waiting
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Stage budgets for the graceful stop escalation, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GracefulStopConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default = "default_natural_exit")]
    pub natural_exit: u64,

    #[serde(default = "default_terminate")]
    pub terminate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_remote")]
    pub remote: String,

    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_program")]
    pub program: String,

    #[serde(default = "default_install_args")]
    pub args: Vec<String>,
}

/// Out-of-band shutdown endpoint exposed by the worker
///
/// Stage 1 of the graceful stop is skipped when `url` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default)]
    pub url: Option<String>,

    /// Environment variable holding the shared secret
    #[serde(default = "default_secret_env")]
    pub secret_env: String,

    #[serde(default = "default_secret_header")]
    pub header: String,
}

/// Service unit controlled by the standalone deploy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Seconds to let the service start before sampling its PID
    #[serde(default = "default_settle")]
    pub settle: u64,
}

// Default value providers
fn default_worker_program() -> String {
    "python3".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["bot.py".to_string()]
}

fn default_deploy_signal() -> PathBuf {
    PathBuf::from(".deploy")
}

fn default_status_file() -> PathBuf {
    PathBuf::from(".status")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from(".deploy.lock")
}

fn default_supervisor_log() -> PathBuf {
    PathBuf::from("supervisor.log")
}

fn default_deploy_log() -> PathBuf {
    PathBuf::from("deploy.log")
}

fn default_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_health_check() -> u64 {
    30
}

fn default_git_timeout() -> u64 {
    120
}

fn default_install_timeout() -> u64 {
    300
}

fn default_restart_backoff() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    5
}

fn default_natural_exit() -> u64 {
    10
}

fn default_terminate() -> u64 {
    3
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_install_program() -> String {
    "python3".to_string()
}

fn default_install_args() -> Vec<String> {
    ["-m", "pip", "install", "-r", "requirements.txt"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_secret_env() -> String {
    "WEBHOOK_SECRET".to_string()
}

fn default_secret_header() -> String {
    "X-Shutdown-Secret".to_string()
}

fn default_service_name() -> String {
    "turbot".to_string()
}

fn default_settle() -> u64 {
    2
}

impl TurbotConfig {
    /// Load configuration from `.turbot/config.toml` or use defaults
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)
                .map_err(|e| TurbotError::Config(format!("Failed to parse config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.turbot/config.toml`
    pub fn write_default(project_dir: &Path) -> Result<PathBuf> {
        let config_dir = project_dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| TurbotError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }
}

impl PathsConfig {
    /// Resolve `path` against the project directory
    pub fn resolve(project_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    }
}

impl TimeoutConfig {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check)
    }

    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.restart_backoff)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ShutdownConfig {
    /// Shared secret from the environment, if the variable is set and non-empty
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env)
            .ok()
            .filter(|secret| !secret.is_empty())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            deploy_signal: default_deploy_signal(),
            status_file: default_status_file(),
            lock_file: default_lock_file(),
            supervisor_log: default_supervisor_log(),
            deploy_log: default_deploy_log(),
            log_max_bytes: default_log_max_bytes(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_check: default_health_check(),
            git: default_git_timeout(),
            install: default_install_timeout(),
            restart_backoff: default_restart_backoff(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for GracefulStopConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            natural_exit: default_natural_exit(),
            terminate: default_terminate(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: default_remote(),
            branch: default_branch(),
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            program: default_install_program(),
            args: default_install_args(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret_env: default_secret_env(),
            header: default_secret_header(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            settle: default_settle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_deploy_constants() {
        let config = TurbotConfig::default();
        assert_eq!(config.timeouts.health_check(), Duration::from_secs(30));
        assert_eq!(config.timeouts.git(), Duration::from_secs(120));
        assert_eq!(config.timeouts.install(), Duration::from_secs(300));
        assert_eq!(config.timeouts.restart_backoff(), Duration::from_secs(5));
        assert_eq!(config.graceful_stop.natural_exit, 10);
        assert_eq!(config.graceful_stop.terminate, 3);
        assert_eq!(config.paths.log_max_bytes, 5 * 1024 * 1024);
        assert_eq!(config.git.remote, "origin");
        assert_eq!(config.git.branch, "main");
        assert!(config.shutdown.url.is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = TurbotConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.worker.args, vec!["bot.py".to_string()]);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            "[timeouts]\nhealth_check = 45\n\n[shutdown]\nurl = \"http://127.0.0.1:8080/shutdown\"\n",
        )
        .unwrap();

        let config = TurbotConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.timeouts.health_check, 45);
        assert_eq!(config.timeouts.git, 120);
        assert_eq!(
            config.shutdown.url.as_deref(),
            Some("http://127.0.0.1:8080/shutdown")
        );
        assert_eq!(config.shutdown.header, "X-Shutdown-Secret");
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join(CONFIG_FILE), "timeouts = 3").unwrap();

        let result = TurbotConfig::load_or_default(dir.path());
        assert!(matches!(result, Err(TurbotError::Config(_))));
    }

    #[test]
    fn test_write_default_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = TurbotConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());

        let config = TurbotConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.service.name, "turbot");
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let root = Path::new("/srv/turbot");
        assert_eq!(
            PathsConfig::resolve(root, Path::new(".status")),
            PathBuf::from("/srv/turbot/.status")
        );
        assert_eq!(
            PathsConfig::resolve(root, Path::new("/var/run/turbot.lock")),
            PathBuf::from("/var/run/turbot.lock")
        );
    }
}
