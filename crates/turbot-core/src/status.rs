//! One-shot status mailbox between the supervisor and the next worker boot
//!
//! The mailbox is a single small JSON file. Writers overwrite it; the reader
//! consumes it by reading then deleting. A crash between the read and the
//! delete can at worst repeat an announcement on the following boot.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{DeployOutcome, Result, TurbotError};

/// File-backed mailbox holding at most one unconsumed `DeployOutcome`
#[derive(Debug, Clone)]
pub struct StatusChannel {
    path: PathBuf,
}

impl StatusChannel {
    /// Create a channel backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the mailbox file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an unconsumed entry exists
    pub fn has_pending(&self) -> bool {
        self.path.exists()
    }

    /// Write `outcome`, replacing any unconsumed entry
    ///
    /// The entry is written to a sibling temp file and renamed into place so
    /// a reader never observes a half-written object.
    pub fn write(&self, outcome: &DeployOutcome) -> Result<()> {
        let json = serde_json::to_string(outcome)?;
        let tmp = self.tmp_path();

        fs::write(&tmp, json).map_err(|e| {
            TurbotError::Status(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            TurbotError::Status(format!(
                "Failed to move status into {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Wrote status outcome: {}", outcome.event());
        Ok(())
    }

    /// Read the pending entry without consuming it
    pub fn peek(&self) -> Option<DeployOutcome> {
        let content = self.read_raw()?;
        match serde_json::from_str(&content) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Ignoring malformed status file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    /// Consume the pending entry
    ///
    /// Malformed content counts as "no outcome": it is logged and removed so
    /// it is not re-read on every boot.
    pub fn read_and_clear(&self) -> Option<DeployOutcome> {
        let content = self.read_raw()?;
        let parsed = serde_json::from_str::<DeployOutcome>(&content);

        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove status file {}: {}", self.path.display(), e);
            }
        }

        match parsed {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Discarding malformed status file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn read_raw(&self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                warn!("Failed to read status file {}: {}", self.path.display(), e);
                None
            }
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "status".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn channel(dir: &TempDir) -> StatusChannel {
        StatusChannel::new(dir.path().join(".status"))
    }

    #[test]
    fn test_write_produces_json_object() {
        let dir = TempDir::new().unwrap();
        let status = channel(&dir);

        status
            .write(&DeployOutcome::DeploySuccess {
                commit: "abc123".to_string(),
            })
            .unwrap();

        let raw = fs::read_to_string(status.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"event": "deploy_success", "commit": "abc123"})
        );
    }

    #[test]
    fn test_write_overwrites_existing() {
        let dir = TempDir::new().unwrap();
        let status = channel(&dir);

        status.write(&DeployOutcome::Restart).unwrap();
        status
            .write(&DeployOutcome::Rollback {
                bad_commit: "bad".to_string(),
                good_commit: "good".to_string(),
            })
            .unwrap();

        assert_eq!(status.peek().unwrap().event(), "rollback");
        assert!(!dir.path().join(".status.tmp").exists());
    }

    #[test]
    fn test_read_and_clear_consumes_once() {
        let dir = TempDir::new().unwrap();
        let status = channel(&dir);

        status.write(&DeployOutcome::Restart).unwrap();
        assert!(status.has_pending());

        assert_eq!(status.read_and_clear(), Some(DeployOutcome::Restart));
        assert!(!status.has_pending());
        assert_eq!(status.read_and_clear(), None);
    }

    #[test]
    fn test_missing_file_is_no_outcome() {
        let dir = TempDir::new().unwrap();
        let status = channel(&dir);

        assert_eq!(status.peek(), None);
        assert_eq!(status.read_and_clear(), None);
    }

    #[test]
    fn test_malformed_file_is_no_outcome_and_removed() {
        let dir = TempDir::new().unwrap();
        let status = channel(&dir);
        fs::write(status.path(), "{not json").unwrap();

        assert_eq!(status.peek(), None);
        assert!(status.has_pending());

        assert_eq!(status.read_and_clear(), None);
        assert!(!status.has_pending());
    }
}
