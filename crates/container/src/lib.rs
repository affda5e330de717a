// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Run a closure inside a private Linux namespace rooted at a caller
//! provided directory.
//!
//! The child enters fresh mount, pid, ipc and uts namespaces (plus a
//! user namespace when invoked rootless, and a net namespace when
//! networking is withheld), pivots into the root and gets the usual
//! pseudo filesystems mounted. Because the closure runs as pid 1 of its
//! own pid namespace, killing it on timeout reliably tears down every
//! process it spawned.

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs_err::{copy, create_dir_all, remove_dir};
use nix::libc::SIGCHLD;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, getgid, getuid, pipe, pivot_root, read, Pid, Uid};
use thiserror::Error;

const STACK_SIZE: usize = 4 * 1024 * 1024;

/// How long to poll for exit after the timeout fires SIGTERM
/// before escalating to SIGKILL
const GRACE: Duration = Duration::from_secs(5);

pub struct Container {
    root: PathBuf,
    work_dir: Option<PathBuf>,
    binds: Vec<Bind>,
    networking: bool,
    hostname: Option<String>,
    timeout: Option<Duration>,
}

struct Bind {
    host: PathBuf,
    guest: PathBuf,
}

impl Container {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            work_dir: None,
            binds: vec![],
            networking: false,
            hostname: None,
            timeout: None,
        }
    }

    /// Override the working directory the closure starts in
    pub fn work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            ..self
        }
    }

    /// Create a read-write bind mount from `host` to `guest`
    pub fn bind(mut self, host: impl Into<PathBuf>, guest: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            host: host.into(),
            guest: guest.into(),
        });
        self
    }

    pub fn networking(self, enabled: bool) -> Self {
        Self {
            networking: enabled,
            ..self
        }
    }

    pub fn hostname(self, hostname: impl ToString) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..self
        }
    }

    /// Wall-clock limit for the contained closure
    pub fn timeout(self, timeout: Option<Duration>) -> Self {
        Self { timeout, ..self }
    }

    /// Clone into the namespace set and run `f` as its init process
    pub fn run(self, mut f: impl FnMut() -> Result<(), Error>) -> Result<(), Error> {
        let rootless = !Uid::effective().is_root();

        // Pipe to hold the child until uid/gid maps are written
        let (pipe_r, pipe_w) = pipe().map_err(Error::Nix)?;
        let read_fd = pipe_r.as_raw_fd();
        let write_fd = pipe_w.as_raw_fd();

        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;

        if rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        if !self.networking {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let mut stack = vec![0u8; STACK_SIZE];

        let pid = unsafe {
            clone(
                Box::new(|| {
                    // Close the inherited write end, then wait for EOF:
                    // parent has finished the id maps
                    let _ = close(write_fd);
                    let _ = read(read_fd, &mut [0u8; 1]);

                    match enter(&self).and_then(|_| f()) {
                        Ok(_) => 0,
                        Err(e) => {
                            eprintln!("container: {e}");
                            1
                        }
                    }
                }),
                &mut stack,
                flags,
                Some(SIGCHLD),
            )
            .map_err(Error::Nix)?
        };

        if rootless {
            // Map the invoking user to root inside the container
            fs_err::write(format!("/proc/{pid}/setgroups"), "deny")?;
            fs_err::write(format!("/proc/{pid}/uid_map"), format!("0 {} 1", getuid()))?;
            fs_err::write(format!("/proc/{pid}/gid_map"), format!("0 {} 1", getgid()))?;
        }

        // Release the child
        drop(pipe_w);

        self.supervise(pid)
    }

    /// Reap the namespace init, enforcing the timeout when one is set
    fn supervise(&self, pid: Pid) -> Result<(), Error> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut terminated = false;
        let mut kill_at: Option<Instant> = None;

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(Error::Nix)? {
                WaitStatus::StillAlive => {}
                WaitStatus::Exited(_, 0) => return Ok(()),
                WaitStatus::Exited(_, code) => {
                    if terminated {
                        return Err(Error::Timeout);
                    }
                    return Err(Error::Failed(code));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    if terminated {
                        return Err(Error::Timeout);
                    }
                    return Err(Error::Signaled(signal));
                }
                _ => {}
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();

                if !terminated && now >= deadline {
                    // Killing pid 1 of the namespace takes every
                    // descendant with it
                    let _ = kill(pid, Signal::SIGTERM);
                    terminated = true;
                    kill_at = Some(now + GRACE);
                } else if terminated && kill_at.is_some_and(|at| now >= at) {
                    let _ = kill(pid, Signal::SIGKILL);
                    kill_at = None;
                }
            }

            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

fn enter(container: &Container) -> Result<(), Error> {
    if container.networking {
        setup_networking(&container.root)?;
    }

    pivot(&container.root, &container.binds)?;

    setup_root_user()?;

    if let Some(hostname) = &container.hostname {
        nix::unistd::sethostname(hostname).map_err(Error::Nix)?;
    }

    if let Some(dir) = &container.work_dir {
        std::env::set_current_dir(dir)?;
    }

    Ok(())
}

fn pivot(root: &Path, binds: &[Bind]) -> Result<(), Error> {
    const OLD_PATH: &str = "old_root";

    let old_root = root.join(OLD_PATH);
    let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

    add_mount(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE)?;
    add_mount(Some(root), root, None, MsFlags::MS_BIND)?;

    for bind in binds {
        let source = bind.host.canonicalize()?;
        let target = root.join(bind.guest.strip_prefix("/").unwrap_or(&bind.guest));
        add_mount(Some(&source), &target, None, MsFlags::MS_BIND)?;
    }

    ensure_directory(&old_root)?;
    pivot_root(root, &old_root).map_err(Error::Nix)?;

    std::env::set_current_dir("/")?;

    add_mount(
        Some("proc"),
        "proc",
        Some("proc"),
        hardened | MsFlags::MS_NOEXEC,
    )?;
    add_mount(
        Some("tmpfs"),
        "tmp",
        Some("tmpfs"),
        hardened | MsFlags::MS_NOEXEC,
    )?;
    add_mount(Some("tmpfs"), "run", Some("tmpfs"), hardened)?;
    add_mount(
        Some(format!("/{OLD_PATH}/sys").as_str()),
        "sys",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;
    add_mount(
        Some(format!("/{OLD_PATH}/dev").as_str()),
        "dev",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;

    umount2(OLD_PATH, MntFlags::MNT_DETACH).map_err(Error::Nix)?;
    remove_dir(OLD_PATH)?;

    Ok(())
}

fn setup_root_user() -> Result<(), Error> {
    ensure_directory("/etc")?;
    fs_err::write("/etc/passwd", "root:x:0:0:root::/bin/bash")?;
    fs_err::write("/etc/group", "root:x:0:")?;
    Ok(())
}

fn setup_networking(root: &Path) -> Result<(), Error> {
    ensure_directory(root.join("etc"))?;
    copy("/etc/resolv.conf", root.join("etc/resolv.conf"))?;
    Ok(())
}

fn ensure_directory(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    if !path.exists() {
        create_dir_all(path)?;
    }
    Ok(())
}

fn add_mount<T: AsRef<Path>>(
    source: Option<T>,
    target: T,
    fs_type: Option<&str>,
    flags: MsFlags,
) -> Result<(), Error> {
    ensure_directory(&target)?;
    mount(
        source.as_ref().map(AsRef::as_ref),
        target.as_ref(),
        fs_type,
        flags,
        Option::<&str>::None,
    )
    .map_err(Error::Nix)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("contained process failed with status code {0}")]
    Failed(i32),
    #[error("contained process stopped by signal {}", .0.as_str())]
    Signaled(Signal),
    #[error("contained process exceeded its timeout")]
    Timeout,
    #[error("nix")]
    Nix(#[source] nix::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
