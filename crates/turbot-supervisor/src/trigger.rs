//! Deploy sentinel file

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use turbot_core::{Result, TurbotError};

/// A file whose presence requests a deploy on the next worker exit
#[derive(Debug, Clone)]
pub struct DeployTrigger {
    path: PathBuf,
}

impl DeployTrigger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_pending(&self) -> bool {
        self.path.exists()
    }

    /// Create the sentinel
    pub fn request(&self) -> Result<()> {
        std::fs::write(&self.path, b"").map_err(|e| {
            TurbotError::Other(format!(
                "Failed to create deploy signal {}: {}",
                self.path.display(),
                e
            ))
        })?;
        debug!("Deploy requested via {}", self.path.display());
        Ok(())
    }

    /// Remove the sentinel, returning whether it was present
    pub fn consume(&self) -> Result<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_request_then_consume() {
        let dir = TempDir::new().unwrap();
        let trigger = DeployTrigger::new(dir.path().join(".deploy"));

        assert!(!trigger.is_pending());
        trigger.request().unwrap();
        assert!(trigger.is_pending());

        assert!(trigger.consume().unwrap());
        assert!(!trigger.is_pending());
        assert!(!trigger.consume().unwrap());
    }
}
