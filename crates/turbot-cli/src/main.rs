//! Turbot CLI - worker supervisor with pull-based deploys and rollback
//!
//! Usage:
//!   turbot init                 Write a default .turbot/config.toml
//!   turbot supervise            Run the worker and deploy on request
//!   turbot deploy               One-shot deploy of a service-managed worker
//!   turbot trigger [--spawn]    Request a deploy
//!   turbot status [--consume]   Show the pending deploy outcome

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, info, warn};
use turbot_core::{PathsConfig, StatusChannel, TurbotConfig};
use turbot_git::{CommandInstaller, GitCommand, VersionControl};
use turbot_supervisor::{
    install_signal_handlers, DeployPipeline, DeploySupervisor, DeployTrigger,
    HttpShutdownChannel, LaunchSpec, ProcessRunner, ShutdownFlag, StandaloneConfig,
    StandaloneDeploy, SupervisorConfig, SystemdUserService, TokioProcessRunner,
};

/// Upper bound on a single systemctl call
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "turbot")]
#[command(author, version, about = "Worker supervisor with pull-based deploys")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Project directory (the worker's git checkout)
    #[arg(short = 'C', long, default_value = ".")]
    project_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default .turbot/config.toml
    Init,

    /// Run the worker, restarting it on exit and deploying on request
    Supervise,

    /// Deploy once into a worker managed by systemd
    Deploy,

    /// Request a deploy on the next worker exit
    Trigger {
        /// Start a detached `turbot deploy` instead of waiting for the supervisor
        #[arg(long)]
        spawn: bool,
    },

    /// Show the pending deploy outcome
    Status {
        /// Remove the outcome after printing it
        #[arg(long)]
        consume: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = std::fs::canonicalize(&cli.project_dir)
        .with_context(|| format!("Project directory {:?} not found", cli.project_dir))?;
    let config = TurbotConfig::load_or_default(&project_dir)?;

    let log_file = match cli.command {
        Commands::Supervise => Some(&config.paths.supervisor_log),
        Commands::Deploy => Some(&config.paths.deploy_log),
        _ => None,
    }
    .map(|path| PathsConfig::resolve(&project_dir, path));
    let _log_guard = logging::init(
        cli.verbose,
        log_file
            .as_deref()
            .map(|path| (path, config.paths.log_max_bytes)),
    )?;

    load_env(&project_dir);

    match cli.command {
        Commands::Init => cmd_init(&project_dir),
        Commands::Supervise => cmd_supervise(&project_dir, &config).await,
        Commands::Deploy => cmd_deploy(&project_dir, &config).await,
        Commands::Trigger { spawn } => cmd_trigger(&project_dir, &config, spawn).await,
        Commands::Status { consume } => cmd_status(&project_dir, &config, consume),
    }
}

fn load_env(project_dir: &Path) {
    match dotenvy::from_path(project_dir.join(".env")) {
        Ok(()) => debug!("Loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!("Ignoring unreadable .env: {}", e),
    }
}

fn pipeline(
    project_dir: &Path,
    config: &TurbotConfig,
) -> DeployPipeline<GitCommand, CommandInstaller> {
    let vcs = VersionControl::new(
        GitCommand::new(project_dir, config.timeouts.git()),
        config.git.remote.clone(),
        config.git.branch.clone(),
    );
    let installer = CommandInstaller::new(
        config.install.program.clone(),
        config.install.args.clone(),
        project_dir,
        config.timeouts.install(),
    );
    DeployPipeline::new(vcs, installer)
}

fn cmd_init(project_dir: &Path) -> Result<ExitCode> {
    let path = TurbotConfig::write_default(project_dir)?;
    println!("Wrote {}", path.display());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_supervise(project_dir: &Path, config: &TurbotConfig) -> Result<ExitCode> {
    let shutdown = ShutdownFlag::new();
    let _signals =
        install_signal_handlers(shutdown.clone()).context("Failed to install signal handlers")?;

    let mut supervisor = DeploySupervisor::new(
        SupervisorConfig::from_config(project_dir, config),
        TokioProcessRunner::new(),
        pipeline(project_dir, config),
        shutdown,
    );

    match (&config.shutdown.url, config.shutdown.secret()) {
        (Some(url), Some(secret)) => {
            let channel = HttpShutdownChannel::new(
                url.clone(),
                config.shutdown.header.clone(),
                secret,
                Duration::from_secs(config.graceful_stop.request_timeout),
            )?;
            supervisor = supervisor.with_shutdown_channel(Box::new(channel));
        }
        (Some(_), None) => warn!(
            "shutdown.url is set but ${} is empty, stopping the worker with signals only",
            config.shutdown.secret_env
        ),
        _ => {}
    }

    supervisor.run().await.context("Supervisor failed")?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_deploy(project_dir: &Path, config: &TurbotConfig) -> Result<ExitCode> {
    let deploy = StandaloneDeploy::new(
        StandaloneConfig::from_config(project_dir, config),
        pipeline(project_dir, config),
        SystemdUserService::new(config.service.name.clone(), SYSTEMCTL_TIMEOUT),
    );

    let outcome = deploy.run().await.context("Deploy failed")?;
    info!("Deploy finished: {:?}", outcome);
    Ok(ExitCode::from(outcome.exit_code() as u8))
}

async fn cmd_trigger(project_dir: &Path, config: &TurbotConfig, spawn: bool) -> Result<ExitCode> {
    let trigger = DeployTrigger::new(PathsConfig::resolve(
        project_dir,
        &config.paths.deploy_signal,
    ));
    if spawn {
        let exe = std::env::current_exe().context("Cannot locate the turbot executable")?;
        let spec = LaunchSpec::new(
            exe.to_string_lossy(),
            vec![
                "--project-dir".to_string(),
                project_dir.to_string_lossy().into_owned(),
                "deploy".to_string(),
            ],
            project_dir,
        )
        .detached();

        let runner = TokioProcessRunner::new();
        let handle = runner.launch(&spec).await?;
        println!("Started deploy (pid {:?})", runner.pid(&handle));
    } else {
        trigger.request()?;
        println!("Deploy requested ({})", trigger.path().display());
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(project_dir: &Path, config: &TurbotConfig, consume: bool) -> Result<ExitCode> {
    let status = StatusChannel::new(PathsConfig::resolve(project_dir, &config.paths.status_file));
    let outcome = if consume {
        status.read_and_clear()
    } else {
        status.peek()
    };

    match outcome {
        Some(outcome) => println!("{}: {}", outcome.event(), outcome.announcement()),
        None => println!("No pending deploy outcome"),
    }
    Ok(ExitCode::SUCCESS)
}
