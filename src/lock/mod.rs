//! Operation lock — machine-wide mutual exclusion per installation directory.
//!
//! Start, Upgrade and Reset must never run concurrently for the same server
//! install, even across separate daemon processes. The lock is a file in a
//! shared lock directory whose name is derived deterministically from the
//! normalized install path, created with `create_new` so acquisition is a
//! single atomic syscall. The file carries the owner PID; a lock whose owner
//! is no longer alive is reclaimed once, never waited on.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use thiserror::Error;

use crate::profile::ServerIdentity;

#[derive(Error, Debug)]
pub enum LockError {
    /// Another operation holds the lock. Recoverable: report and stop,
    /// do not retry automatically.
    #[error("install directory is locked by another operation (pid {holder_pid:?})")]
    Contended { holder_pid: Option<u32> },
    /// The lock file could not be created for reasons other than
    /// contention. Fatal configuration problem (permissions, missing dir).
    #[error("failed to create lock file at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive ownership of one install directory's operation lock.
/// Released explicitly or on drop; release is idempotent.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    owned: bool,
}

impl LockGuard {
    /// Release the lock. Safe to call more than once; only the first call
    /// touches the filesystem.
    pub fn release(&mut self) {
        if !self.owned {
            return;
        }
        self.owned = false;
        if let Err(e) = fs::remove_file(&self.path) {
            // The directory may have been cleaned externally; the lock is
            // gone either way.
            tracing::warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        } else {
            tracing::debug!("Released operation lock {}", self.path.display());
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct LockManager {
    lock_dir: PathBuf,
}

impl LockManager {
    pub fn new(lock_dir: &Path) -> Self {
        Self {
            lock_dir: lock_dir.to_path_buf(),
        }
    }

    /// Non-blocking acquisition. Returns immediately with the guard or
    /// `LockError::Contended`; never queues.
    pub fn try_acquire(&self, identity: &ServerIdentity) -> Result<LockGuard, LockError> {
        let path = self.lock_path(&identity.install_dir);

        match self.create_lock_file(&path) {
            Ok(guard) => Ok(guard),
            Err(LockError::Contended { holder_pid }) => {
                // Reclaim a stale lock left behind by a dead process, once.
                if let Some(pid) = holder_pid {
                    if !process_alive(pid) {
                        tracing::warn!(
                            "Reclaiming stale lock {} (owner pid {} is gone)",
                            path.display(),
                            pid
                        );
                        let _ = fs::remove_file(&path);
                        return self.create_lock_file(&path);
                    }
                }
                Err(LockError::Contended { holder_pid })
            }
            Err(e) => Err(e),
        }
    }

    fn create_lock_file(&self, path: &Path) -> Result<LockGuard, LockError> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = write!(file, "{}", std::process::id()) {
                    tracing::warn!("Failed to write pid into lock file: {}", e);
                }
                tracing::debug!("Acquired operation lock {}", path.display());
                Ok(LockGuard {
                    path: path.to_path_buf(),
                    owned: true,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder_pid = fs::read_to_string(path)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok());
                Err(LockError::Contended { holder_pid })
            }
            Err(e) => Err(LockError::Io {
                path: path.display().to_string(),
                source: e,
            }),
        }
    }

    /// Deterministic lock file path for an install directory, stable across
    /// processes and unaffected by trailing separators or case on Windows.
    fn lock_path(&self, install_dir: &Path) -> PathBuf {
        let normalized = normalize_install_dir(install_dir);
        let digest = Sha256::digest(normalized.as_bytes());
        let name = format!("warden-{}.lock", &hex::encode(digest)[..16]);
        self.lock_dir.join(name)
    }
}

fn normalize_install_dir(dir: &Path) -> String {
    let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let s = canonical.to_string_lossy();
    let trimmed = s.trim_end_matches(['/', '\\']);
    if cfg!(windows) {
        trimmed.to_lowercase()
    } else {
        trimmed.to_string()
    }
}

fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(dir: &Path) -> ServerIdentity {
        ServerIdentity {
            server_id: "test".to_string(),
            display_name: "test".to_string(),
            install_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_mutual_exclusion() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());
        let id = identity(install.path());

        let first = mgr.try_acquire(&id).unwrap();
        let second = mgr.try_acquire(&id);
        assert!(matches!(second, Err(LockError::Contended { .. })));

        drop(first);
        // released on drop, second attempt now succeeds
        assert!(mgr.try_acquire(&id).is_ok());
    }

    #[test]
    fn test_release_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());
        let id = identity(install.path());

        let mut guard = mgr.try_acquire(&id).unwrap();
        guard.release();
        assert!(!guard.is_owned());
        // second release is a no-op, and the drop afterwards too
        guard.release();
        drop(guard);

        assert!(mgr.try_acquire(&id).is_ok());
    }

    #[test]
    fn test_release_does_not_affect_other_holder() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());
        let id = identity(install.path());

        let mut first = mgr.try_acquire(&id).unwrap();
        first.release();

        let second = mgr.try_acquire(&id).unwrap();
        // releasing the already-released first guard again must not free
        // the lock now held by the second guard
        first.release();
        assert!(matches!(
            mgr.try_acquire(&id),
            Err(LockError::Contended { .. })
        ));
        drop(second);
    }

    #[test]
    fn test_different_install_dirs_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let install_a = tempfile::tempdir().unwrap();
        let install_b = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());

        let _a = mgr.try_acquire(&identity(install_a.path())).unwrap();
        assert!(mgr.try_acquire(&identity(install_b.path())).is_ok());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());
        let id = identity(install.path());

        // Forge a lock file owned by a pid that cannot be alive.
        let path = mgr.lock_path(install.path());
        fs::write(&path, "4294967294").unwrap();

        let guard = mgr.try_acquire(&id);
        assert!(guard.is_ok(), "stale lock should be reclaimed: {:?}", guard.err());
    }

    #[test]
    fn test_live_holder_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tempfile::tempdir().unwrap();
        let mgr = LockManager::new(tmp.path());
        let id = identity(install.path());

        // Our own pid is certainly alive.
        let path = mgr.lock_path(install.path());
        fs::write(&path, std::process::id().to_string()).unwrap();

        match mgr.try_acquire(&id) {
            Err(LockError::Contended { holder_pid }) => {
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("expected contention, got {:?}", other.map(|g| g.is_owned())),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_lock_dir_is_fatal_not_contention() {
        let mgr = LockManager::new(Path::new("/definitely/not/a/real/dir"));
        let install = tempfile::tempdir().unwrap();
        let result = mgr.try_acquire(&identity(install.path()));
        assert!(matches!(result, Err(LockError::Io { .. })));
    }
}
