// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The per-package build state machine.
//!
//! `Idle → Prepared → Configured → Built → Checked → Staged → Stripped
//! → Packaged`, any state falling to `Failed` which triggers rollback.
//! Stages never retry internally; the orchestrator owns retry policy.
//! All subprocess work flows through the injected [`sandbox::Runner`].

use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use fs_err as fs;
use metafile::HookStage;
use thiserror::Error;

use crate::{
    artifact,
    config::Config,
    fetch::{self, Fetcher},
    recipe,
    sandbox::{self, Exec, Runner, Sandbox, Session, RESTRICTED_PATH},
    util,
};

use self::step::Commands;

pub mod step;

/// Patch strip levels tried in order
const STRIP_LEVELS: &[u8] = &[1, 0, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum State {
    Idle,
    Prepared,
    Configured,
    Built,
    Checked,
    Staged,
    Stripped,
    Packaged,
    Failed,
}

/// Stage names as surfaced in errors and batch summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Prepare,
    Configure,
    Build,
    Check,
    Staging,
    Strip,
    Package,
}

#[derive(Debug)]
pub struct Outcome {
    pub artifact: artifact::Artifact,
    /// Per-package build log, preserved outside the session
    pub log_path: PathBuf,
}

pub struct Pipeline<'a> {
    recipe: &'a recipe::Loaded,
    config: &'a Config,
    fetcher: &'a Fetcher,
    sandbox: &'a Sandbox,
    runner: &'a dyn Runner,
    artifacts: &'a artifact::Store,

    state: State,
    session: Option<Session>,
    src_dir: PathBuf,
    staging: PathBuf,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        recipe: &'a recipe::Loaded,
        config: &'a Config,
        fetcher: &'a Fetcher,
        sandbox: &'a Sandbox,
        runner: &'a dyn Runner,
        artifacts: &'a artifact::Store,
    ) -> Self {
        Self {
            recipe,
            config,
            fetcher,
            sandbox,
            runner,
            artifacts,
            state: State::Idle,
            session: None,
            src_dir: PathBuf::new(),
            staging: PathBuf::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Drive the machine to `Packaged` or roll back.
    ///
    /// The session is released on every exit path; the build log
    /// survives under the logs directory either way.
    pub fn run(mut self, cancel: &AtomicBool) -> Result<Outcome, Error> {
        let result = self.execute(cancel);

        let log_path = self.persist_log();

        match result {
            Ok(artifact) => {
                self.release();
                Ok(Outcome { artifact, log_path })
            }
            Err(error) => {
                self.state = State::Failed;
                log::error!(
                    target: "pipeline",
                    "{} failed during {error}, log at {log_path:?}",
                    self.recipe.name(),
                );
                self.release();
                Err(error)
            }
        }
    }

    fn execute(&mut self, cancel: &AtomicBool) -> Result<artifact::Artifact, Error> {
        let version = self
            .recipe
            .version()
            .ok_or_else(|| Error::MissingVersion(self.recipe.name().to_owned()))?
            .to_owned();

        let mut timing = Timing::default();

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        self.prepare()?;
        timing.finish(Stage::Prepare, timer);
        self.state = State::Prepared;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        let commands = self.configure()?;
        timing.finish(Stage::Configure, timer);
        self.state = State::Configured;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        self.build(&commands)?;
        timing.finish(Stage::Build, timer);
        self.state = State::Built;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        self.check(&commands)?;
        timing.finish(Stage::Check, timer);
        self.state = State::Checked;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        self.stage(&commands)?;
        timing.finish(Stage::Staging, timer);
        self.state = State::Staged;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        self.strip()?;
        timing.finish(Stage::Strip, timer);
        self.state = State::Stripped;

        self.checkpoint(cancel)?;
        let timer = timing.begin();
        let artifact = self
            .artifacts
            .pack(self.recipe.name(), &version, &self.staging)?;
        timing.finish(Stage::Package, timer);
        self.state = State::Packaged;

        log::info!(
            target: "pipeline",
            "{} timings: {timing}",
            self.recipe.name()
        );

        Ok(artifact)
    }

    fn checkpoint(&self, cancel: &AtomicBool) -> Result<(), Error> {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Session, sources, extraction, patches
    fn prepare(&mut self) -> Result<(), Error> {
        let session = self.sandbox.create()?;
        self.staging = session.dir.join("stage");
        fs::create_dir_all(&self.staging)?;
        self.session = Some(session);

        self.hook(HookStage::PrePrepare)?;

        let session = self.session.clone().expect("session created");

        // Fetch and verify every declared source, then unpack
        for source in &self.recipe.parsed.sources {
            let fetched = self
                .fetcher
                .fetch(&source.uri, source.sha256.as_deref(), None)?;

            if fetched.is_dir() {
                // Git working tree
                let name = util::uri_file_name(&source.uri);
                util::copy_dir(&fetched, &session.work.join(name))?;
            } else {
                fetch::extract(&fetched, &session.work)?;
            }
        }

        // Pre-fetched archives from a declared sources directory
        if let Some(dir) = &self.recipe.parsed.sources_dir {
            let dir = self.recipe.dir().join(dir);
            for archive in util::enumerate_files(&dir, |_| true)? {
                fetch::extract(&archive, &session.work)?;
            }
        }

        self.src_dir = detect_src_dir(&session.work)?;

        self.apply_patches(&session)?;

        self.hook(HookStage::PostPrepare)?;

        Ok(())
    }

    /// Strip levels 1, 0, 2 in sequence per patch; failure of all
    /// three fails the build with the patch index
    fn apply_patches(&self, session: &Session) -> Result<(), Error> {
        for (index, reference) in self.recipe.parsed.patches.iter().enumerate() {
            let path = self.resolve_patch(reference)?;

            let applied = STRIP_LEVELS.iter().any(|level| {
                let exec = Exec {
                    script: format!(
                        "patch -N -p{level} -i {}",
                        shell_quote(&path.display().to_string())
                    ),
                    cwd: self.src_dir.clone(),
                    env: vec![],
                    timeout: self.config.stage_timeout,
                    isolated: false,
                };

                self.runner.run(session, &exec).is_ok()
            });

            if !applied {
                return Err(Error::PatchFailed { index });
            }
        }

        Ok(())
    }

    /// Patches may be local (relative to the recipe) or remote
    fn resolve_patch(&self, reference: &str) -> Result<PathBuf, Error> {
        if let Ok(url) = url::Url::parse(reference) {
            if matches!(url.scheme(), "http" | "https" | "ftp" | "file") {
                return Ok(self.fetcher.fetch(&url, None, None)?);
            }
        }

        Ok(self.recipe.dir().join(reference))
    }

    fn configure(&mut self) -> Result<Commands, Error> {
        let build = &self.recipe.parsed.build;

        let system = match build.system {
            metafile::BuildSystem::Auto => step::detect(&self.src_dir),
            other => other,
        };
        log::info!(target: "pipeline", "{}: build system {system}", self.recipe.name());

        let commands = step::commands(build, system);

        self.hook(HookStage::PreConfigure)?;

        if let Some(script) = &commands.configure {
            self.run_stage(Stage::Configure, script)?;
        }

        self.hook(HookStage::PostConfigure)?;

        Ok(commands)
    }

    fn build(&mut self, commands: &Commands) -> Result<(), Error> {
        self.hook(HookStage::PreBuild)?;

        if let Some(script) = &commands.build {
            self.run_stage(Stage::Build, script)?;
        }

        self.hook(HookStage::PostBuild)?;

        Ok(())
    }

    /// Check failures are warnings unless the recipe opts into
    /// strict_check
    fn check(&mut self, commands: &Commands) -> Result<(), Error> {
        self.hook(HookStage::PreCheck)?;

        if let Some(script) = &commands.check {
            match self.run_stage(Stage::Check, script) {
                Ok(_) => {}
                Err(error) if self.recipe.parsed.build.strict_check => return Err(error),
                Err(error) => {
                    log::warn!(
                        target: "pipeline",
                        "{}: check stage failed ({error}), continuing",
                        self.recipe.name()
                    );
                }
            }
        }

        self.hook(HookStage::PostCheck)?;

        Ok(())
    }

    /// Install into the staged tree, under fakeroot when unprivileged
    /// and available
    fn stage(&mut self, commands: &Commands) -> Result<(), Error> {
        self.hook(HookStage::PreInstall)?;

        let script = commands.install.as_ref().ok_or(Error::NoInstallCommand)?;

        let script = if !util::is_root() && tool_available("fakeroot") {
            format!("fakeroot -- /bin/sh -c {}", shell_quote(script))
        } else {
            script.clone()
        };

        self.run_stage(Stage::Staging, &script)?;

        self.hook(HookStage::PostInstall)?;

        Ok(())
    }

    /// Strip unneeded symbols from ELF objects; per-file failures
    /// restore the in-session backup and continue
    fn strip(&mut self) -> Result<(), Error> {
        let session = self.session.clone().expect("session exists");
        let backups = session.tmp.join("strip-backup");
        fs::create_dir_all(&backups)?;

        let mut stripped = 0usize;

        for (n, file) in util::enumerate_files(&self.staging, |_| true)?
            .into_iter()
            .enumerate()
        {
            if !is_elf(&file)? {
                continue;
            }

            let backup = backups.join(n.to_string());
            fs::copy(&file, &backup)?;

            let exec = Exec {
                script: format!(
                    "strip --strip-unneeded {}",
                    shell_quote(&file.display().to_string())
                ),
                cwd: self.staging.clone(),
                env: vec![],
                timeout: self.config.stage_timeout,
                isolated: false,
            };

            match self.runner.run(&session, &exec) {
                Ok(_) => stripped += 1,
                Err(error) => {
                    log::warn!(
                        target: "pipeline",
                        "strip failed for {file:?} ({error}), restoring original"
                    );
                    fs::copy(&backup, &file)?;
                }
            }
        }

        if stripped > 0 {
            log::info!(target: "pipeline", "{}: stripped {stripped} objects", self.recipe.name());
        }

        Ok(())
    }

    fn run_stage(&self, stage: Stage, script: &str) -> Result<(), Error> {
        let session = self.session.as_ref().expect("session exists");

        let exec = Exec {
            script: script.to_owned(),
            cwd: self.src_dir.clone(),
            env: self.stage_env(),
            timeout: self.config.stage_timeout,
            isolated: false,
        };

        self.runner
            .run(session, &exec)
            .map_err(|error| Error::Stage { stage, error })
    }

    fn stage_env(&self) -> Vec<(String, String)> {
        let recipe = &self.recipe.parsed;

        let mut env = vec![
            ("PKG_NAME".to_owned(), recipe.name.clone()),
            (
                "PKG_VERSION".to_owned(),
                recipe.version.clone().unwrap_or_default(),
            ),
            ("PREFIX".to_owned(), recipe.build.prefix().to_owned()),
            (
                "JOBS".to_owned(),
                recipe.build.jobs.unwrap_or(self.config.jobs).to_string(),
            ),
            ("DESTDIR".to_owned(), self.staging.display().to_string()),
            ("BUILD_DIR".to_owned(), self.src_dir.display().to_string()),
            ("STAGING_DIR".to_owned(), self.staging.display().to_string()),
        ];

        env.extend(recipe.environment.iter().cloned());
        env
    }

    /// Run the hook for `stage` when the recipe declares one.
    /// `pre_*` failures are fatal; `post_*` failures warn unless the
    /// recipe marks hooks strict.
    fn hook(&self, stage: HookStage) -> Result<(), Error> {
        let Some(reference) = self.recipe.parsed.hooks.get(&stage) else {
            return Ok(());
        };

        let session = self.session.as_ref().expect("session exists");
        let path = self.resolve_hook(stage, reference)?;

        let tools_dir = session.dir.join("tools");
        let mut env = self.stage_env();
        env.push((
            "PATH".to_owned(),
            format!("{RESTRICTED_PATH}:{}", tools_dir.display()),
        ));

        // pre_prepare fires before the source dir exists
        let cwd = if self.src_dir.as_os_str().is_empty() {
            session.work.clone()
        } else {
            self.src_dir.clone()
        };

        let exec = Exec {
            script: format!("/bin/sh {}", shell_quote(&path.display().to_string())),
            cwd,
            env,
            timeout: self.config.stage_timeout,
            isolated: false,
        };

        match self.runner.run(session, &exec) {
            Ok(_) => Ok(()),
            Err(error) => {
                let fatal = stage.to_string().starts_with("pre_") || self.recipe.parsed.strict_hooks;

                if fatal {
                    Err(Error::Hook {
                        stage,
                        script: reference.clone(),
                        error,
                    })
                } else {
                    log::warn!(
                        target: "pipeline",
                        "{}: {stage} hook failed ({error}), continuing",
                        self.recipe.name()
                    );
                    Ok(())
                }
            }
        }
    }

    /// Hooks must live inside the recipe directory unless trusted
    fn resolve_hook(&self, stage: HookStage, reference: &str) -> Result<PathBuf, Error> {
        let raw = Path::new(reference);

        let escapes = raw.is_absolute()
            || raw
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir));

        if escapes && !self.config.trust_hooks {
            return Err(Error::UntrustedHook {
                stage,
                path: raw.to_path_buf(),
            });
        }

        if raw.is_absolute() {
            Ok(raw.to_path_buf())
        } else {
            Ok(self.recipe.dir().join(raw))
        }
    }

    /// Copy the session log out so failures keep their evidence
    fn persist_log(&self) -> PathBuf {
        let target = self
            .config
            .logs_dir
            .join(format!("{}-build.log", self.recipe.name()));

        if let Some(session) = &self.session {
            if session.log_path().exists() {
                let _ = fs::copy(session.log_path(), &target);
            }
        }

        target
    }

    /// Rollback / release: staged tree and session directories go,
    /// caches and the recipe stay untouched
    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(error) = self.sandbox.cleanup(&session) {
                log::error!(target: "pipeline", "session cleanup failed: {error}");
            }
        }
    }
}

/// Wall-clock accounting per stage, reported once a build packages
#[derive(Debug, Default)]
struct Timing {
    stages: Vec<(Stage, std::time::Duration)>,
}

impl Timing {
    fn begin(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn finish(&mut self, stage: Stage, timer: std::time::Instant) {
        self.stages.push((stage, timer.elapsed()));
    }
}

impl std::fmt::Display for Timing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self
            .stages
            .iter()
            .map(|(stage, elapsed)| format!("{stage} {:.1}s", elapsed.as_secs_f64()))
            .collect::<Vec<_>>()
            .join(", ");
        rendered.fmt(f)
    }
}

/// A tarball usually unpacks to a single top level directory; use it
/// as the source dir when it does
fn detect_src_dir(work: &Path) -> Result<PathBuf, Error> {
    let entries: Vec<_> = fs::read_dir(work)?.flatten().collect();

    match entries.as_slice() {
        [single] if single.metadata().map(|m| m.is_dir()).unwrap_or(false) => {
            Ok(single.path())
        }
        _ => Ok(work.to_path_buf()),
    }
}

fn is_elf(path: &Path) -> io::Result<bool> {
    use std::io::Read;

    let mut magic = [0u8; 4];
    let mut file = fs_err::File::open(path)?;

    match file.read_exact(&mut magic) {
        Ok(_) => Ok(magic == [0x7f, b'E', b'L', b'F']),
        Err(_) => Ok(false),
    }
}

fn tool_available(name: &str) -> bool {
    RESTRICTED_PATH
        .split(':')
        .any(|dir| Path::new(dir).join(name).exists())
}

/// Single-quote for `sh -c`
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe for {0} declares no version")]
    MissingVersion(String),
    #[error("prepare: {0}")]
    Fetch(#[from] fetch::Error),
    #[error("prepare: patch {index} failed at every strip level")]
    PatchFailed { index: usize },
    #[error("{stage} hook `{script}`")]
    Hook {
        stage: HookStage,
        script: String,
        #[source]
        error: sandbox::Error,
    },
    #[error("{stage} hook path {path:?} is outside the recipe directory")]
    UntrustedHook { stage: HookStage, path: PathBuf },
    #[error("{stage}")]
    Stage {
        stage: Stage,
        #[source]
        error: sandbox::Error,
    },
    #[error("staging: no install command for this build system")]
    NoInstallCommand,
    #[error("sandbox")]
    Sandbox(#[from] sandbox::Error),
    #[error("package")]
    Artifact(#[from] artifact::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// Which stage failed, for batch summaries
    pub fn stage(&self) -> Stage {
        match self {
            Error::MissingVersion(_)
            | Error::Fetch(_)
            | Error::PatchFailed { .. }
            | Error::Sandbox(_)
            | Error::Io(_)
            | Error::Cancelled => Stage::Prepare,
            Error::Hook { stage, .. } | Error::UntrustedHook { stage, .. } => match stage {
                HookStage::PrePrepare | HookStage::PostPrepare => Stage::Prepare,
                HookStage::PreConfigure | HookStage::PostConfigure => Stage::Configure,
                HookStage::PreBuild | HookStage::PostBuild => Stage::Build,
                HookStage::PreCheck | HookStage::PostCheck => Stage::Check,
                _ => Stage::Staging,
            },
            Error::Stage { stage, .. } => *stage,
            Error::NoInstallCommand => Stage::Staging,
            Error::Artifact(_) => Stage::Package,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Fetch(e) if e.is_transient())
    }
}
