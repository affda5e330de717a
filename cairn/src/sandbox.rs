// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build session isolation.
//!
//! A session owns a disjoint directory tree under the sandbox base:
//! `root/` (the guest rootfs), `work/` (sources and build trees),
//! `logs/` and `tmp/`. Pseudo filesystems are acquired scoped and
//! released on drop, panics included. All subprocess execution in the
//! whole orchestrator funnels through the [`Runner`] trait here, which
//! is what lets tests substitute a recording fake.

use std::{
    io,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use fs_err as fs;
use fs_err::File;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use crate::{config::Config, util};

/// Baseline PATH handed to every sandboxed or hook process
pub const RESTRICTED_PATH: &str = "/usr/bin:/usr/sbin:/bin:/sbin";

/// An ephemeral, isolated working context for one package build
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub root: PathBuf,
    pub work: PathBuf,
    pub logs: PathBuf,
    pub tmp: PathBuf,
}

impl Session {
    pub fn log_path(&self) -> PathBuf {
        self.logs.join("build.log")
    }
}

/// A command bound for the sandbox, always executed via `sh -c`
#[derive(Debug, Clone)]
pub struct Exec {
    pub script: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Run inside the session root's namespace rather than on the host
    pub isolated: bool,
}

/// The only seam through which subprocesses are spawned
pub trait Runner: Send + Sync {
    fn run(&self, session: &Session, exec: &Exec) -> Result<(), Error>;
}

pub struct Sandbox {
    base: PathBuf,
}

impl Sandbox {
    pub fn new(config: &Config) -> Self {
        Self {
            base: config.sandbox_dir.clone(),
        }
    }

    /// Allocate a fresh session: `<utc-timestamp>-<pid>`
    pub fn create(&self) -> Result<Session, Error> {
        let id = format!("{}-{}", util::timestamp(), std::process::id());
        let dir = self.base.join(&id);

        let session = Session {
            root: dir.join("root"),
            work: dir.join("work"),
            logs: dir.join("logs"),
            tmp: dir.join("tmp"),
            id,
            dir,
        };

        for path in [&session.root, &session.work, &session.logs, &session.tmp] {
            fs::create_dir_all(path)?;
        }

        Ok(session)
    }

    /// Acquire `proc`, `sys`, `dev`, `run` and `tmp` under the session
    /// root. Privileged only; the rootless path gets equivalent mounts
    /// from its user namespace instead.
    ///
    /// The returned guard unmounts on drop, on every exit path.
    pub fn mount_pseudofs(&self, session: &Session) -> Result<MountSet, Error> {
        let mut set = MountSet::default();

        if !util::is_root() {
            log::debug!("skipping pseudo-fs mounts for rootless session {}", session.id);
            return Ok(set);
        }

        let hardened = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

        set.add(
            session.root.join("proc"),
            Some("proc"),
            Some("proc"),
            hardened | MsFlags::MS_NOEXEC,
        )?;
        set.add(
            session.root.join("sys"),
            Some("sysfs"),
            Some("sysfs"),
            hardened | MsFlags::MS_NOEXEC,
        )?;
        // dev wants device nodes, so nodev stays off
        set.add(
            session.root.join("dev"),
            Some("tmpfs"),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
        )?;
        set.add(
            session.root.join("run"),
            Some("tmpfs"),
            Some("tmpfs"),
            hardened,
        )?;
        set.add(
            session.root.join("tmp"),
            Some("tmpfs"),
            Some("tmpfs"),
            hardened | MsFlags::MS_NOEXEC,
        )?;

        // Essential device nodes, bound from the host
        for node in ["null", "zero", "urandom", "tty"] {
            let target = session.root.join("dev").join(node);
            let source = PathBuf::from("/dev").join(node);
            if source.exists() {
                let _ = File::create(&target);
                set.bind(&source, target)?;
            }
        }

        Ok(set)
    }

    /// Tear down a session, refusing anything that resolves outside
    /// the sandbox base
    pub fn cleanup(&self, session: &Session) -> Result<(), Error> {
        let resolved = session
            .dir
            .canonicalize()
            .unwrap_or_else(|_| session.dir.clone());
        let base = self
            .base
            .canonicalize()
            .unwrap_or_else(|_| self.base.clone());

        if resolved == Path::new("/") || !resolved.starts_with(&base) {
            return Err(Error::UnsafeCleanup(resolved));
        }

        // Sweep any mount a crashed guard left behind
        for target in ["proc", "sys", "dev", "run", "tmp"] {
            force_unmount(&session.root.join(target));
        }

        if resolved.exists() {
            fs::remove_dir_all(&resolved)?;
        }

        Ok(())
    }
}

impl Runner for Sandbox {
    fn run(&self, session: &Session, exec: &Exec) -> Result<(), Error> {
        let log = File::options()
            .create(true)
            .append(true)
            .open(session.log_path())?;

        {
            let mut header = log.file();
            let _ = writeln!(header, "+ {}", exec.script.replace('\n', "\n+ "));
        }

        if exec.isolated {
            run_isolated(session, exec, &log)
        } else {
            run_host(exec, &log)
        }
    }
}

/// Namespace execution: the session root becomes `/`, the work tree is
/// bound at `/work`, and the container enforces the timeout by killing
/// its pid-1
fn run_isolated(session: &Session, exec: &Exec, log: &File) -> Result<(), Error> {
    let cwd = guest_path(session, &exec.cwd);
    let stdout = log.file().try_clone()?;
    let stderr = log.file().try_clone()?;
    let exec = exec.clone();

    container::Container::new(&session.root)
        .bind(&session.work, "/work")
        .work_dir(&cwd)
        .hostname("cairn")
        .timeout(Some(exec.timeout))
        .run(move || {
            let status = command(&exec)
                .current_dir(&cwd)
                .stdout(Stdio::from(stdout.try_clone()?))
                .stderr(Stdio::from(stderr.try_clone()?))
                .status()?;

            if status.success() {
                Ok(())
            } else {
                Err(container::Error::Failed(status.code().unwrap_or(1)))
            }
        })
        .map_err(map_container)
}

/// Host execution in its own process group so a timeout can terminate
/// the whole tree: TERM, a grace period, then KILL
fn run_host(exec: &Exec, log: &File) -> Result<(), Error> {
    use std::os::unix::process::CommandExt;

    let mut child = command(exec)
        .current_dir(&exec.cwd)
        .process_group(0)
        .stdout(Stdio::from(log.file().try_clone()?))
        .stderr(Stdio::from(log.file().try_clone()?))
        .spawn()?;

    let pgid = Pid::from_raw(child.id() as i32);
    let deadline = Instant::now() + exec.timeout;

    loop {
        if let Some(status) = child.try_wait()? {
            return if status.success() {
                Ok(())
            } else {
                Err(Error::CommandFailed(status.code().unwrap_or(1)))
            };
        }

        if Instant::now() >= deadline {
            let _ = killpg(pgid, Signal::SIGTERM);

            let grace = Instant::now() + Duration::from_secs(5);
            while Instant::now() < grace {
                if child.try_wait()?.is_some() {
                    return Err(Error::Timeout(exec.timeout));
                }
                std::thread::sleep(Duration::from_millis(50));
            }

            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait();
            return Err(Error::Timeout(exec.timeout));
        }

        std::thread::sleep(Duration::from_millis(25));
    }
}

fn command(exec: &Exec) -> std::process::Command {
    let mut command = std::process::Command::new("/bin/sh");
    command.arg("-c").arg(&exec.script);
    command.env_clear();
    command.env("PATH", RESTRICTED_PATH);
    command.env("HOME", &exec.cwd);
    command.env("LC_ALL", "C");

    for (key, value) in &exec.env {
        command.env(key, value);
    }

    command
}

/// Map a host path under the session work tree to its `/work` guest
/// location
fn guest_path(session: &Session, host: &Path) -> PathBuf {
    match host.strip_prefix(&session.work) {
        Ok(relative) => Path::new("/work").join(relative),
        Err(_) => host.to_path_buf(),
    }
}

fn map_container(error: container::Error) -> Error {
    match error {
        container::Error::Failed(code) => Error::CommandFailed(code),
        container::Error::Timeout => Error::Timeout(Duration::ZERO),
        other => Error::Container(other),
    }
}

/// Unmount with a bounded retry, falling back to a lazy detach
fn force_unmount(target: &Path) {
    if !target.exists() {
        return;
    }

    for _ in 0..3 {
        match umount2(target, MntFlags::empty()) {
            Ok(_) => return,
            Err(nix::errno::Errno::EINVAL | nix::errno::Errno::ENOENT) => return,
            Err(_) => std::thread::sleep(Duration::from_millis(100)),
        }
    }

    let _ = umount2(target, MntFlags::MNT_DETACH);
}

/// Scoped pseudo filesystem mounts, unmounted in reverse order on drop
#[derive(Debug, Default)]
pub struct MountSet {
    targets: Vec<PathBuf>,
}

impl MountSet {
    fn add(
        &mut self,
        target: PathBuf,
        source: Option<&str>,
        fs_type: Option<&str>,
        flags: MsFlags,
    ) -> Result<(), Error> {
        util::ensure_dir_exists(&target)?;

        mount(source, &target, fs_type, flags, Option::<&str>::None)
            .map_err(|e| Error::Mount(target.clone(), e))?;

        self.targets.push(target);
        Ok(())
    }

    fn bind(&mut self, source: &Path, target: PathBuf) -> Result<(), Error> {
        mount(
            Some(source),
            &target,
            Option::<&str>::None,
            MsFlags::MS_BIND,
            Option::<&str>::None,
        )
        .map_err(|e| Error::Mount(target.clone(), e))?;

        self.targets.push(target);
        Ok(())
    }
}

impl Drop for MountSet {
    fn drop(&mut self) {
        for target in self.targets.iter().rev() {
            force_unmount(target);
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("command failed with status code {0}")]
    CommandFailed(i32),
    #[error("command exceeded its {0:?} timeout")]
    Timeout(Duration),
    #[error("mounting {0:?}")]
    Mount(PathBuf, #[source] nix::Error),
    #[error("refusing to clean up {0:?}: outside the sandbox base")]
    UnsafeCleanup(PathBuf),
    #[error("container")]
    Container(#[source] container::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn sandbox(dir: &Path) -> Sandbox {
        let mut config = Config::load(Some(dir.to_path_buf())).unwrap();
        config.sandbox_dir = dir.join("sandbox");
        fs::create_dir_all(&config.sandbox_dir).unwrap();
        Sandbox::new(&config)
    }

    #[test]
    fn sessions_have_disjoint_trees() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let a = sandbox.create().unwrap();
        let b = sandbox.create().unwrap();

        assert_ne!(a.dir, b.dir);
        for session in [&a, &b] {
            assert!(session.root.is_dir());
            assert!(session.work.is_dir());
            assert!(session.logs.is_dir());
            assert!(session.tmp.is_dir());
        }
    }

    #[test]
    fn host_commands_log_and_report_status() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());
        let session = sandbox.create().unwrap();

        let ok = Exec {
            script: "echo out; echo err >&2".to_owned(),
            cwd: session.work.clone(),
            env: vec![],
            timeout: Duration::from_secs(10),
            isolated: false,
        };
        sandbox.run(&session, &ok).unwrap();

        let log = fs::read_to_string(session.log_path()).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));

        let bad = Exec {
            script: "exit 3".to_owned(),
            ..ok
        };
        assert!(matches!(
            sandbox.run(&session, &bad),
            Err(Error::CommandFailed(3))
        ));
    }

    #[test]
    fn timeouts_terminate_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());
        let session = sandbox.create().unwrap();

        let hang = Exec {
            script: "sleep 60".to_owned(),
            cwd: session.work.clone(),
            env: vec![],
            timeout: Duration::from_millis(200),
            isolated: false,
        };

        let started = Instant::now();
        assert!(matches!(
            sandbox.run(&session, &hang),
            Err(Error::Timeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn cleanup_refuses_to_escape_the_base() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox(dir.path());

        let rogue = Session {
            id: "rogue".to_owned(),
            dir: PathBuf::from("/"),
            root: PathBuf::from("/root"),
            work: PathBuf::from("/work"),
            logs: PathBuf::from("/logs"),
            tmp: PathBuf::from("/tmp"),
        };

        assert!(matches!(
            sandbox.cleanup(&rogue),
            Err(Error::UnsafeCleanup(_))
        ));

        let session = sandbox.create().unwrap();
        sandbox.cleanup(&session).unwrap();
        assert!(!session.dir.exists());
    }
}
