//! Advisory file locking with a bounded wait.
//!
//! A store file is locked exclusively for as long as the store is open. The
//! lock is an OS-level advisory lock (`flock` on Unix, `LockFileEx` on
//! Windows), released when the [`FileLock`] is dropped or the process exits.
//!
//! When the lock is contended, a helper thread performs the blocking lock call
//! while the opener waits on a condition variable with a deadline. If the
//! deadline passes first, the open fails with [`Error::LockTimeout`] and the
//! helper releases the lock as soon as it eventually gets it.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// An exclusive lock on a store file.
///
/// The lock is automatically released when this struct is dropped.
pub struct FileLock {
    /// Handle sharing the locked file description.
    file: File,
    /// Path of the locked file.
    path: PathBuf,
}

/// Outcome of the helper thread's blocking lock call.
enum LockWait {
    Pending,
    Acquired,
    Failed(io::Error),
    /// The opener gave up; the helper must release anything it acquires.
    Abandoned,
}

struct Shared {
    state: Mutex<LockWait>,
    ready: Condvar,
}

impl FileLock {
    /// Acquires an exclusive lock on `file`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if another holder keeps the lock past the
    /// deadline, or [`Error::Io`] if locking fails for another reason.
    ///
    /// # Timeouts
    ///
    /// A timed-out call leaves its `kvs-lock-wait` helper thread blocked in the
    /// OS lock call, holding a duplicate of the file handle, until the current
    /// holder releases the lock. The helper then unlocks and exits. Callers
    /// that retry in a loop accumulate one such thread per failed attempt
    /// while the file stays locked, so back off between retries or raise
    /// `lock_timeout` instead.
    pub fn acquire(file: &File, path: &Path, timeout: Duration) -> Result<Self> {
        let handle = file.try_clone()?;

        match handle.try_lock_exclusive() {
            Ok(()) => {
                info!(path = %path.display(), "Acquired exclusive lock on store file");
                return Ok(Self { file: handle, path: path.to_path_buf() });
            },
            Err(e) if is_contended(&e) => {
                debug!(path = %path.display(), ?timeout, "Store file is locked, waiting");
            },
            Err(e) => {
                error!(path = %path.display(), error = %e, "Failed to lock store file");
                return Err(e.into());
            },
        }

        if timeout.is_zero() {
            return Err(Error::LockTimeout { path: path.to_path_buf(), timeout });
        }

        let shared =
            Arc::new(Shared { state: Mutex::new(LockWait::Pending), ready: Condvar::new() });
        let waiter = handle.try_clone()?;
        let waiter_shared = Arc::clone(&shared);
        let waiter_path = path.to_path_buf();
        thread::Builder::new().name("kvs-lock-wait".to_string()).spawn(move || {
            let outcome = waiter.lock_exclusive();
            let mut state = waiter_shared.state.lock();
            if matches!(*state, LockWait::Abandoned) {
                if outcome.is_ok() {
                    if let Err(e) = FileExt::unlock(&waiter) {
                        error!(
                            path = %waiter_path.display(),
                            error = %e,
                            "Failed to release abandoned store file lock"
                        );
                    } else {
                        debug!(path = %waiter_path.display(), "Released abandoned store file lock");
                    }
                }
                return;
            }
            *state = match outcome {
                Ok(()) => LockWait::Acquired,
                Err(e) => LockWait::Failed(e),
            };
            waiter_shared.ready.notify_one();
        })?;

        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        while matches!(*state, LockWait::Pending) {
            if shared.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        match std::mem::replace(&mut *state, LockWait::Abandoned) {
            LockWait::Acquired => {
                info!(
                    path = %path.display(),
                    "Acquired exclusive lock on store file after waiting"
                );
                Ok(Self { file: handle, path: path.to_path_buf() })
            },
            LockWait::Failed(e) => {
                error!(path = %path.display(), error = %e, "Failed to lock store file");
                Err(e.into())
            },
            LockWait::Pending | LockWait::Abandoned => {
                warn!(path = %path.display(), ?timeout, "Timed out waiting for store file lock");
                Err(Error::LockTimeout { path: path.to_path_buf(), timeout })
            },
        }
    }

    /// Returns the path of the locked file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!(path = %self.path.display(), error = %e, "Failed to release store file lock");
        } else {
            info!(path = %self.path.display(), "Released store file lock");
        }
    }
}

/// Whether a failed `try_lock` means "held by someone else".
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
