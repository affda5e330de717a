// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Named mutual exclusion across processes.
//!
//! A lock is an advisory `flock` on a file under the locks directory,
//! released on drop (or by the kernel when the holder dies). Filesystems
//! without advisory lock support fall back to lock directories carrying
//! the holder pid, validated for staleness before a steal.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use fs_err as fs;
use fs_err::File;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;

const POLL: Duration = Duration::from_millis(50);

/// Well-known lock names, in the global acquisition order that
/// precludes deadlock
pub mod name {
    pub const RECIPE_STORE: &str = "recipe-store";
    pub const INSTALLED_DB: &str = "installed-db";
    pub const GLOBAL_BUILD: &str = "global-build";
    pub const LOG_ROTATE: &str = "log-rotate";

    pub fn package(name: &str) -> String {
        format!("package/{name}")
    }

    pub fn cache_entry(name: &str, version: &str) -> String {
        format!("cache-entry/{name}-{version}")
    }

    pub fn source(basename: &str) -> String {
        format!("source/{basename}")
    }
}

#[derive(Debug, Clone)]
pub struct Manager {
    dir: PathBuf,
}

impl Manager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Acquire `name`, blocking up to `timeout`.
    ///
    /// The loop polls so it can honor both the hard deadline and the
    /// cooperative `cancel` flag between attempts.
    pub fn acquire(
        &self,
        name: impl fmt::Display,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<Lock, Error> {
        let name = name.to_string();
        let deadline = Instant::now() + timeout;

        loop {
            match self.try_acquire(&name)? {
                Some(lock) => return Ok(lock),
                None => {
                    if cancel.load(Ordering::Relaxed) {
                        return Err(Error::Cancelled(name));
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(name));
                    }
                    std::thread::sleep(POLL);
                }
            }
        }
    }

    /// Single non-blocking attempt; `None` means the lock is held
    /// elsewhere (would-block)
    pub fn try_acquire(&self, name: &str) -> Result<Option<Lock>, Error> {
        let path = self.lock_path(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::options()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match Flock::lock(file.into_parts().0, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                let _ = fs::write(&path, format!("{}\n", std::process::id()));
                Ok(Some(Lock(Inner::Flock(flock))))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            // Advisory locks unsupported here: fall back to a lock
            // directory carrying the holder pid
            Err((_, Errno::ENOLCK | Errno::EOPNOTSUPP | Errno::ENOSYS)) => {
                self.try_acquire_dir(name)
            }
            Err((_, errno)) => Err(Error::Flock(errno)),
        }
    }

    fn try_acquire_dir(&self, name: &str) -> Result<Option<Lock>, Error> {
        let dir = self.lock_path(name).with_extension("lock.d");

        match fs::create_dir(&dir) {
            Ok(_) => {
                fs::write(dir.join("pid"), format!("{}\n", std::process::id()))?;
                Ok(Some(Lock(Inner::Dir(dir))))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if holder_is_stale(&dir) {
                    // Steal: remove the stale lock and retry once
                    let _ = fs::remove_dir_all(&dir);
                    return self.try_acquire_dir(name);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        // `package/foo` nests a directory per namespace
        let mut path = self.dir.clone();
        for part in name.split('/') {
            path.push(part);
        }
        path.set_extension("lock");
        path
    }
}

/// A dead holder pid makes a directory lock stealable
fn holder_is_stale(dir: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(dir.join("pid")) else {
        // No pid recorded: treat a half-created lock as stale
        return true;
    };

    let Ok(pid) = raw.trim().parse::<i32>() else {
        return true;
    };

    !PathBuf::from(format!("/proc/{pid}")).exists()
}

/// An acquired named lock, released on drop.
///
/// Acquisition is non-reentrant: a holder must not acquire the
/// same name again.
#[derive(Debug)]
pub struct Lock(Inner);

#[derive(Debug)]
enum Inner {
    Flock(#[allow(unused)] Flock<std::fs::File>),
    Dir(PathBuf),
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Inner::Dir(dir) = &self.0 {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for lock `{0}`")]
    Timeout(String),
    #[error("cancelled while waiting for lock `{0}`")]
    Cancelled(String),
    #[error("obtaining exclusive file lock")]
    Flock(#[source] Errno),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exclusivity_within_process_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());

        let held = manager.try_acquire("package/demo").unwrap();
        assert!(held.is_some());

        drop(held);
        assert!(manager.try_acquire("package/demo").unwrap().is_some());
    }

    #[test]
    fn timeout_fires() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        let cancel = AtomicBool::new(false);

        let _held = manager.try_acquire("global-build").unwrap().unwrap();

        let err = manager
            .acquire("global-build", Duration::from_millis(120), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn cancel_flag_aborts_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());
        let cancel = AtomicBool::new(true);

        let _held = manager.try_acquire("installed-db").unwrap().unwrap();

        let err = manager
            .acquire("installed-db", Duration::from_secs(5), &cancel)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn stale_dir_lock_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Manager::new(dir.path());

        // Fabricate a stale directory lock with an impossible pid
        let stale = manager.lock_path("package/old").with_extension("lock.d");
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("pid"), "999999999\n").unwrap();

        assert!(manager.try_acquire_dir("package/old").unwrap().is_some());
    }
}
