//! Per-repository advisory locks.
//!
//! Pull and fsck coordinate through a lock file inside each repository
//! (`<repo>/.grokmirror.lock`), plus a legacy sibling lock next to the
//! repository directory kept for 1.x-era tooling that still checks it.
//! The locks are advisory between grokmirror processes only; bare git
//! does not honor them.
//!
//! Release is RAII: dropping the handle unlocks, and the OS releases the
//! flock if the process dies. The lock files themselves are left in
//! place.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{GrokError, Result};

const LOCKFILE: &str = ".grokmirror.lock";

/// Held lock on one repository. Unlocks on drop.
#[derive(Debug)]
pub struct RepoLock {
    primary: File,
    legacy: Option<File>,
    path: PathBuf,
}

fn open_lockfile(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

/// Path of the legacy sibling lock: `.<basename>.lock` next to the
/// repository directory.
fn legacy_lock_path(repo: &Path) -> Option<PathBuf> {
    let name = repo.file_name()?.to_string_lossy();
    Some(repo.parent()?.join(format!(".{}.lock", name)))
}

impl RepoLock {
    /// Acquire the lock, blocking until available.
    pub fn acquire(repo: &Path) -> Result<RepoLock> {
        let path = repo.join(LOCKFILE);
        let primary = open_lockfile(&path)?;
        primary.lock_exclusive()?;
        Ok(RepoLock {
            legacy: Self::acquire_legacy(repo),
            primary,
            path,
        })
    }

    /// Acquire without blocking; [`GrokError::LockBusy`] if another
    /// process holds it.
    pub fn try_acquire(repo: &Path) -> Result<RepoLock> {
        let path = repo.join(LOCKFILE);
        let primary = open_lockfile(&path)?;
        if primary.try_lock_exclusive().is_err() {
            return Err(GrokError::LockBusy { path });
        }
        Ok(RepoLock {
            legacy: Self::acquire_legacy(repo),
            primary,
            path,
        })
    }

    /// Acquire with a deadline, polling. Used by pull workers so a repo
    /// held by a long fsck doesn't stall the pass past its refresh
    /// window.
    pub fn acquire_with_deadline(repo: &Path, deadline: Duration) -> Result<RepoLock> {
        let start = Instant::now();
        loop {
            match Self::try_acquire(repo) {
                Err(GrokError::LockBusy { path }) => {
                    if start.elapsed() >= deadline {
                        return Err(GrokError::LockBusy { path });
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
                other => return other,
            }
        }
    }

    /// Best-effort legacy lock. Failure to take it is not an error: the
    /// sibling directory may be unwritable, and 1.x interop is advisory
    /// on top of advisory.
    fn acquire_legacy(repo: &Path) -> Option<File> {
        let path = legacy_lock_path(repo)?;
        let file = open_lockfile(&path).ok()?;
        file.try_lock_exclusive().ok()?;
        Some(file)
    }

    /// Lock for a repository that doesn't exist on disk yet.
    ///
    /// The in-repo lock file needs a repository to live in, and `git
    /// clone` wants its destination absent, so clones are guarded by the
    /// sibling lock alone. Blocks until available.
    pub fn acquire_for_clone(repo: &Path) -> Result<RepoLock> {
        let path = legacy_lock_path(repo).ok_or_else(|| {
            GrokError::Io(std::io::Error::other("repository path has no parent"))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let primary = open_lockfile(&path)?;
        primary.lock_exclusive()?;
        Ok(RepoLock {
            primary,
            legacy: None,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.primary);
        if let Some(legacy) = &self.legacy {
            let _ = fs2::FileExt::unlock(legacy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("a.git");
        std::fs::create_dir(&repo).unwrap();

        let lock = RepoLock::acquire(&repo).unwrap();
        assert!(repo.join(LOCKFILE).exists());
        drop(lock);

        // Released: can be taken again without blocking.
        let lock = RepoLock::try_acquire(&repo).unwrap();
        drop(lock);
    }

    #[test]
    fn test_legacy_sibling_lock_created() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("a.git");
        std::fs::create_dir(&repo).unwrap();

        let _lock = RepoLock::acquire(&repo).unwrap();
        assert!(dir.path().join(".a.git.lock").exists());
    }

    #[test]
    fn test_second_holder_is_busy() {
        // flock(2) conflicts between open file descriptions, so two
        // handles in one process are enough to exercise contention.
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("a.git");
        std::fs::create_dir(&repo).unwrap();

        let _held = RepoLock::acquire(&repo).unwrap();
        match RepoLock::try_acquire(&repo) {
            Err(GrokError::LockBusy { .. }) => {}
            Ok(_) => panic!("lock should have been busy"),
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_deadline_expires() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("a.git");
        std::fs::create_dir(&repo).unwrap();

        let _held = RepoLock::acquire(&repo).unwrap();
        let start = Instant::now();
        let res = RepoLock::acquire_with_deadline(&repo, Duration::from_millis(600));
        assert!(start.elapsed() >= Duration::from_millis(600));
        match res {
            Err(GrokError::LockBusy { .. }) => {}
            Ok(_) => panic!("lock should have been busy"),
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
}
