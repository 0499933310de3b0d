//! PID-aware file mutex.
//!
//! The lock file holds the owner's PID. It is written to a private sibling
//! first and then hard-linked into place, so the lock path never exists
//! without its PID. A lock whose PID is no longer alive (or whose content
//! cannot be parsed) is stale and is removed before the link is attempted.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Distinguishes sibling files created by threads of one process.
static SIBLING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    pid: u32,
}

impl FileLock {
    /// Lock owned by the current process.
    pub fn new(path: &Path) -> Self {
        Self::with_pid(path, std::process::id())
    }

    pub fn with_pid(path: &Path, pid: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            pid,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock. `Ok(false)` means a live process holds it.
    pub fn acquire(&self) -> Result<bool> {
        self.remove_if_stale()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let staged = self.sibling("new");
        fs::write(&staged, format!("{}\n", self.pid))
            .with_context(|| format!("write lock {}", staged.display()))?;
        let linked = fs::hard_link(&staged, &self.path);
        remove_quietly(&staged);
        match linked {
            Ok(()) => {
                debug!(path = %self.path.display(), pid = self.pid, "lock acquired");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %self.path.display(), "lock already held");
                Ok(false)
            }
            Err(err) => Err(err).with_context(|| format!("create lock {}", self.path.display())),
        }
    }

    /// Remove the lock if it belongs to this PID. Returns whether it was removed.
    pub fn release(&self) -> Result<bool> {
        match read_owner(&self.path)? {
            Some(Some(owner)) if owner == self.pid => {
                fs::remove_file(&self.path)
                    .with_context(|| format!("remove lock {}", self.path.display()))?;
                debug!(path = %self.path.display(), "lock released");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Acquire or fail with [`RelayError::LockHeld`]. The guard releases on drop.
    pub fn hold(self) -> Result<LockGuard> {
        if self.acquire()? {
            return Ok(LockGuard { lock: self });
        }
        let pid = read_owner(&self.path)?.flatten();
        Err(RelayError::LockHeld {
            path: self.path.clone(),
            pid,
        }
        .into())
    }

    /// Move a stale lock aside, then make sure it was not replaced by a live one in between.
    fn remove_if_stale(&self) -> Result<()> {
        if !is_stale(read_owner(&self.path)?) {
            return Ok(());
        }
        let aside = self.sibling("stale");
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("remove stale lock {}", self.path.display()));
            }
        }
        if is_stale(read_owner(&aside)?) {
            info!(path = %self.path.display(), "removed stale lock");
        } else {
            // Another process took the lock after our read; put it back.
            debug!(path = %self.path.display(), "restoring live lock");
            if let Err(err) = fs::hard_link(&aside, &self.path)
                && err.kind() != ErrorKind::AlreadyExists
            {
                remove_quietly(&aside);
                return Err(err).with_context(|| format!("restore lock {}", self.path.display()));
            }
        }
        remove_quietly(&aside);
        Ok(())
    }

    fn sibling(&self, tag: &str) -> PathBuf {
        let seq = SIBLING_SEQ.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        self.path
            .with_file_name(format!(".{name}.{tag}.{}.{seq}", std::process::id()))
    }
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    lock: FileLock,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.lock.release() {
            warn!(err = %err, path = %self.lock.path.display(), "failed to release lock");
        }
    }
}

fn is_stale(owner: Option<Option<u32>>) -> bool {
    match owner {
        None => false,
        Some(None) => true,
        Some(Some(pid)) => !pid_alive(pid),
    }
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != ErrorKind::NotFound
    {
        warn!(err = %err, path = %path.display(), "failed to remove lock sibling");
    }
}

/// `None` if there is no lock file, `Some(None)` if its content is not a PID.
fn read_owner(path: &Path) -> Result<Option<Option<u32>>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.trim().parse::<u32>().ok())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read lock {}", path.display())),
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    pid != 0
}
