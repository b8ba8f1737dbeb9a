//! Exclusive, non-blocking deploy lock

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use turbot_core::{Result, TurbotError};

/// Held for the duration of one deploy attempt
///
/// Backed by an advisory `flock` on the lock file, so the OS drops it if the
/// holder dies. Released on drop.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

/// Result of a lock attempt
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(DeployLock),
    /// Another deploy holds the lock
    Contended,
}

impl DeployLock {
    /// Try to take the lock without waiting
    ///
    /// Contention is not an error. Any other failure to open or lock the
    /// file is `TurbotError::Lock`.
    pub fn try_acquire(path: &Path) -> Result<LockAttempt> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| TurbotError::Lock(format!("Failed to open {}: {}", path.display(), e)))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                debug!("Deploy lock {} is held elsewhere", path.display());
                return Ok(LockAttempt::Contended);
            }
            Err(e) => {
                return Err(TurbotError::Lock(format!(
                    "Failed to lock {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        // Holder PID, for whoever is debugging a stuck deploy
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!("Acquired deploy lock {}", path.display());
        Ok(LockAttempt::Acquired(DeployLock {
            file,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!("Released deploy lock {}", self.path.display());
    }
}

fn is_contended(error: &std::io::Error) -> bool {
    error.kind() == ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_contended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".deploy.lock");

        let first = DeployLock::try_acquire(&path).unwrap();
        assert!(matches!(first, LockAttempt::Acquired(_)));

        let second = DeployLock::try_acquire(&path).unwrap();
        assert!(matches!(second, LockAttempt::Contended));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".deploy.lock");

        {
            let lock = DeployLock::try_acquire(&path).unwrap();
            assert!(matches!(lock, LockAttempt::Acquired(_)));
        }

        assert!(matches!(
            DeployLock::try_acquire(&path).unwrap(),
            LockAttempt::Acquired(_)
        ));
    }

    #[test]
    fn test_records_holder_pid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".deploy.lock");

        let _lock = DeployLock::try_acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_unopenable_path_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join(".deploy.lock");

        assert!(matches!(
            DeployLock::try_acquire(&path),
            Err(TurbotError::Lock(_))
        ));
    }
}
