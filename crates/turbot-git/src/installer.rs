//! Dependency installation step of the deploy pipeline

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use turbot_core::{Result, TurbotError};

use crate::command::output_with_timeout;

/// Installs the worker's dependencies for the checked-out commit
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self) -> Result<()>;
}

/// Installer that runs a configured command in the project directory
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandInstaller {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        working_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            timeout,
        }
    }

    fn label(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    #[instrument(skip(self), fields(dir = %self.working_dir.display()))]
    async fn install(&self) -> Result<()> {
        let label = self.label();
        info!("Installing dependencies: {}", label);

        let output = output_with_timeout(
            Command::new(&self.program)
                .args(&self.args)
                .current_dir(&self.working_dir),
            self.timeout,
            &label,
        )
        .await
        .map_err(|e| match e {
            TurbotError::Io(io) => TurbotError::Install(format!("Failed to run {}: {}", label, io)),
            other => other,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TurbotError::Install(format!(
                "{} exited with {}: {}",
                label,
                output.status,
                stderr.trim()
            )));
        }

        debug!("Dependencies installed");
        Ok(())
    }
}

/// Mock installer for testing
///
/// Fails the first `fail_first` calls, then succeeds. Clones share the
/// call counter.
#[derive(Debug, Clone, Default)]
pub struct MockInstaller {
    fail_first: usize,
    calls: Arc<AtomicUsize>,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(fail_first: usize) -> Self {
        Self {
            fail_first,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageInstaller for MockInstaller {
    async fn install(&self) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(TurbotError::Install(
                "mock install failure: no matching distribution".to_string(),
            ));
        }
        Ok(())
    }
}
