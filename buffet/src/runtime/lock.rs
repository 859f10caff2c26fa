//! Home directory lock.
//!
//! Two runtimes sharing a home would both believe they own every slot in
//! the registry, and a sweep in one would tear down the other's sessions.
//! An exclusive `flock` on `<home>/.lock` rules that out.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use buffet_shared::errors::{BuffetError, BuffetResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::runtime::constants::filenames;

/// Exclusive hold on a home directory.
///
/// Released when dropped, or by the kernel if the process dies.
pub struct RuntimeLock {
    _flock: Flock<File>,
    path: PathBuf,
}

impl RuntimeLock {
    /// Attempt to acquire an exclusive, non-blocking lock on `home_dir`.
    ///
    /// Fails immediately if another runtime already holds it.
    pub fn acquire(home_dir: &Path) -> BuffetResult<Self> {
        std::fs::create_dir_all(home_dir)
            .map_err(|e| BuffetError::Storage(format!("failed to create home dir: {}", e)))?;

        let lock_path = home_dir.join(filenames::LOCK_FILE);

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| BuffetError::Storage(format!("failed to open lock file: {}", e)))?;

        let flock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => flock,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(BuffetError::InvalidState(format!(
                    "Another buffet runtime is already using directory: {}\n\
                     Only one runtime instance can use a BUFFET_HOME directory at a time.",
                    home_dir.display()
                )));
            }
            Err((_, errno)) => {
                return Err(BuffetError::Storage(format!(
                    "failed to acquire lock: {}",
                    errno
                )));
            }
        };

        tracing::debug!(lock_path = %lock_path.display(), "Acquired runtime lock");

        Ok(RuntimeLock {
            _flock: flock,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RuntimeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLock").field("path", &self.path).finish()
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        tracing::debug!(lock_path = %self.path.display(), "Released runtime lock");
    }
}
