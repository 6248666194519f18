use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const OWNER_FILE: &str = "owner.pid";

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock {path:?}")]
    TimedOut { path: PathBuf, waited: Duration },
    #[error("lock I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A cross-process lock held as a directory.
///
/// `create_dir` is atomic, so whoever creates the directory owns the lock.
/// The owner's pid is written inside; a lock whose owner is gone is
/// reclaimed by the next caller. Dropping the guard removes the directory.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    /// Blocks, polling every `poll`, until the lock is ours.
    pub fn acquire(path: impl Into<PathBuf>, poll: Duration) -> Result<Self, LockError> {
        Self::acquire_within(path, poll, None)
    }

    pub fn acquire_within(
        path: impl Into<PathBuf>,
        poll: Duration,
        limit: Option<Duration>,
    ) -> Result<Self, LockError> {
        let path = path.into();
        let started = Instant::now();
        let mut announced = false;
        loop {
            if let Some(lock) = Self::try_acquire(&path)? {
                return Ok(lock);
            }
            if !announced {
                debug!("waiting for lock {:?}", path);
                announced = true;
            }
            let waited = started.elapsed();
            if limit.is_some_and(|limit| waited >= limit) {
                return Err(LockError::TimedOut { path, waited });
            }
            thread::sleep(poll);
        }
    }

    /// One attempt; `None` while another live process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        match fs::create_dir(path) {
            Ok(()) => {
                let lock = DirLock {
                    path: path.to_path_buf(),
                };
                fs::write(path.join(OWNER_FILE), std::process::id().to_string())
                    .map_err(io_err)?;
                Ok(Some(lock))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(dead) = Self::stale_owner(path) {
                    warn!("reclaiming stale lock {:?} of pid {}", path, dead);
                    Self::reclaim(path, dead).map_err(io_err)?;
                }
                Ok(None)
            }
            Err(e) => Err(io_err(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn owner(path: &Path) -> Option<u32> {
        fs::read_to_string(path.join(OWNER_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()
            .filter(|pid| *pid != 0)
    }

    /// The owner's pid when it is no longer running. A freshly created lock
    /// may not have its pid written yet, so an unreadable owner counts as live.
    fn stale_owner(path: &Path) -> Option<u32> {
        Self::owner(path).filter(|pid| !process_alive(*pid))
    }

    /// Claims the owner file by rename, so only one reclaimer wins, and only
    /// removes the lock if the claimed file still names `dead`.
    fn reclaim(path: &Path, dead: u32) -> io::Result<()> {
        let mut claimed = path.as_os_str().to_owned();
        claimed.push(format!(".stale-{}", std::process::id()));
        let claimed = PathBuf::from(claimed);
        let owner_file = path.join(OWNER_FILE);
        match fs::rename(&owner_file, &claimed) {
            Ok(()) => {}
            // Somebody else reclaimed it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        let claimed_pid = fs::read_to_string(&claimed)?.trim().parse::<u32>().ok();
        if claimed_pid != Some(dead) {
            // The lock changed hands after it was judged stale.
            debug!("lock {:?} is now held by {:?}, leaving it", path, claimed_pid);
            if fs::rename(&claimed, &owner_file).is_err() {
                fs::remove_file(&claimed)?;
            }
            return Ok(());
        }
        fs::remove_file(&claimed)?;
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(unix)]
pub(crate) fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub(crate) fn process_alive(_pid: u32) -> bool {
    true
}
