use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use log::{debug, warn};

use crate::error::{Result, UpdateError};

/// Well-known identifier shared by the host process and the second-stage
/// bootstrap. Both sides must agree on it forever.
pub const CLIENT_LOCK_GUID: &str = "b5d9626f-6173-4f1c-93b0-e6a7a8cf4e3e";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cross-process exclusion lock named by [`CLIENT_LOCK_GUID`].
///
/// The host acquires it at startup and holds it for its lifetime; the
/// second stage waits on it so it only touches the tree after the host has
/// exited. The lock is an OS advisory file lock, so an owner that dies
/// releases it implicitly and a waiter then acquires what a named-mutex
/// world would call an abandoned mutex.
pub struct ClientLock {
    _file: File,
    path: PathBuf,
}

impl ClientLock {
    fn lock_path() -> PathBuf {
        std::env::temp_dir().join(format!("{CLIENT_LOCK_GUID}.lock"))
    }

    /// Take the lock without waiting. `None` means another process holds it.
    pub fn try_acquire() -> Result<Option<Self>> {
        let path = Self::lock_path();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                UpdateError::FilesystemFailed(format!(
                    "unable to open lock file {}: {e}",
                    path.display()
                ))
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("lock: acquired {}", path.display());
                Ok(Some(Self { _file: file, path }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => {
                warn!("lock: probe of {} failed: {err}", path.display());
                Ok(None)
            }
        }
    }

    /// Poll for the lock until the deadline passes.
    pub fn wait_acquire(timeout: Duration) -> Result<Self> {
        let start = Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire()? {
                debug!(
                    "lock: acquired after {} ms",
                    start.elapsed().as_millis()
                );
                return Ok(lock);
            }
            if start.elapsed() >= timeout {
                return Err(UpdateError::MutexTimeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_first_is_dropped() {
        let first = match ClientLock::try_acquire().unwrap() {
            Some(lock) => lock,
            // Another test process on this machine holds the global lock;
            // nothing meaningful to assert then.
            None => return,
        };
        assert!(ClientLock::try_acquire().unwrap().is_none());

        let waited = ClientLock::wait_acquire(Duration::from_millis(150));
        assert!(matches!(waited, Err(UpdateError::MutexTimeout)));

        drop(first);
        let again = ClientLock::try_acquire().unwrap();
        assert!(again.is_some());
    }
}
