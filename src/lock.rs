//! File-based advisory locking.
//!
//! Two locks exist: the daemon's single-instance lock
//! (`<state_dir>/blockwarden.pid.lock`, held for the process lifetime) and the
//! state lock (`<state_dir>/state.lock`, held around every store mutation by
//! both the daemon and the administrative CLI).

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// Name of the single-instance lock file inside the state directory.
pub const INSTANCE_LOCK_FILE: &str = "blockwarden.pid.lock";

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A guard that holds an exclusive lock on a lock file.
/// The lock is released when the guard is dropped, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Take the daemon's single-instance lock without waiting.
    ///
    /// Returns an error if another daemon already holds it. The holder's PID is
    /// written into the file for operators.
    pub fn acquire_instance(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(INSTANCE_LOCK_FILE);
        let mut file = open_lock_file(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another blockwarden daemon is already running.\n\
                 Lock file: {}",
                path.display()
            )
        })?;

        file.set_len(0).ok();
        writeln!(file, "{}", std::process::id()).ok();

        Ok(Self { file, path })
    }

    /// Acquire an exclusive lock, retrying until `timeout` elapses.
    ///
    /// Opens (or creates) the file with read+write and without truncation to
    /// avoid a race between creation and locking. Waiting yields to the
    /// runtime between attempts, so a lock held by the CLI never stalls the
    /// daemon's other tasks.
    pub async fn acquire(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let file = open_lock_file(path).map_err(|source| StoreError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(_) if Instant::now() < deadline => tokio::time::sleep(RETRY_INTERVAL).await,
                Err(_) => return Err(StoreError::LockTimeout(timeout)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// PID of the running daemon, if another process holds the instance lock.
pub fn running_daemon(state_dir: &Path) -> Option<u32> {
    let path = state_dir.join(INSTANCE_LOCK_FILE);
    let file = OpenOptions::new().read(true).open(&path).ok()?;
    if file.try_lock_shared().is_ok() {
        let _ = FileExt::unlock(&file);
        return None;
    }
    let pid = fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse().ok());
    Some(pid.unwrap_or(0))
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock as well; unlock explicitly
        // so the release does not depend on other clones of the fd.
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    // Owner read/write only
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        {
            let guard = LockGuard::acquire(&path, Duration::from_secs(1)).await.unwrap();
            assert_eq!(guard.path(), path.as_path());
        }
        // Released on drop, so a second acquisition succeeds immediately
        let _again = LockGuard::acquire(&path, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_times_out_while_held() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        let _held = LockGuard::acquire(&path, Duration::from_secs(1)).await.unwrap();

        let result = LockGuard::acquire(&path, Duration::from_millis(120)).await;
        assert!(matches!(result, Err(StoreError::LockTimeout(_))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_lock_wait_does_not_block_runtime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        let held = LockGuard::acquire(&path, Duration::from_secs(1)).await.unwrap();

        // On a single-threaded runtime the release can only run if the
        // waiter yields while it retries.
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(held);
        });
        let waited = LockGuard::acquire(&path, Duration::from_secs(2)).await;
        assert!(waited.is_ok());
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_file_permissions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        let _guard = LockGuard::acquire(&path, Duration::from_secs(1)).await.unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_instance_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let first = LockGuard::acquire_instance(dir.path()).unwrap();
        let second = LockGuard::acquire_instance(dir.path());
        assert!(second.is_err());
        assert!(second
            .unwrap_err()
            .to_string()
            .contains("already running"));

        let pid = fs::read_to_string(dir.path().join(INSTANCE_LOCK_FILE)).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        drop(first);
        assert!(LockGuard::acquire_instance(dir.path()).is_ok());
    }

    #[test]
    fn test_running_daemon_detection() {
        let dir = TempDir::new().unwrap();
        assert_eq!(running_daemon(dir.path()), None);
        let guard = LockGuard::acquire_instance(dir.path()).unwrap();
        assert_eq!(running_daemon(dir.path()), Some(std::process::id()));
        drop(guard);
        assert_eq!(running_daemon(dir.path()), None);
    }

    #[tokio::test]
    async fn test_lock_released_on_panic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.lock");
        let p = path.clone();
        let result = tokio::spawn(async move {
            let _guard = LockGuard::acquire(&p, Duration::from_secs(1)).await.unwrap();
            panic!("boom");
        })
        .await;
        assert!(result.is_err());
        assert!(LockGuard::acquire(&path, Duration::from_millis(10)).await.is_ok());
    }
}
