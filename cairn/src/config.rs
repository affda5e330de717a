// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Explicit configuration passed to every component at construction.
//!
//! Environment variables are read exactly once, here. Components never
//! consult process state themselves; dynamic toggles travel as arguments.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;
use url::Url;

use crate::util;

/// What the orchestrator does when a package in a batch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FailPolicy {
    /// Stop the batch at the first failure
    #[default]
    Abort,
    /// Record the failure and keep going
    Continue,
    /// Keep going unless the failed package is depended upon by
    /// a remaining one
    AbortOnCritical,
}

/// Artifact archive compression; zstd unless the operator opts down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Compression {
    #[default]
    Zstd,
    Xz,
    Gzip,
}

impl Compression {
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Zstd => "tar.zst",
            Compression::Xz => "tar.xz",
            Compression::Gzip => "tar.gz",
        }
    }
}

/// Disposition for locally modified files encountered by uninstall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ModifiedPolicy {
    /// Leave the file in place and report it
    #[default]
    Keep,
    /// Move the file aside with a timestamped suffix
    Backup,
    /// Delete it regardless
    Force,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem subtree packages are installed into
    pub target_root: PathBuf,
    /// Ordered recipe search roots, first root wins
    pub recipe_roots: Vec<PathBuf>,
    /// Downloaded source archives
    pub sources_dir: PathBuf,
    /// Packed binary artifacts
    pub binaries_dir: PathBuf,
    /// Artifact manifests
    pub manifests_dir: PathBuf,
    /// installed.db, depends.db and json state
    pub state_dir: PathBuf,
    pub locks_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Build session trees live underneath this
    pub sandbox_dir: PathBuf,

    pub recipe_backups_keep: usize,
    pub db_backups_keep: usize,
    pub artifact_keep_per_package: usize,
    pub artifact_retention_days: u64,
    pub source_retention_days: u64,

    pub mirrors: Vec<Url>,
    pub fetch_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub connect_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Reject downloads smaller than this many bytes
    pub source_min_bytes: u64,

    /// Default wall-clock limit for one build stage subprocess
    pub stage_timeout: Duration,
    /// Parallelism handed to build systems
    pub jobs: usize,
    /// Concurrent package builds
    pub workers: usize,
    /// Additional attempts the orchestrator grants a failed package
    pub retries: u32,
    pub fail_policy: FailPolicy,
    pub modified_policy: ModifiedPolicy,
    pub dry_run: bool,
    /// Unresolvable dependencies abort resolution instead of
    /// becoming leaves
    pub strict_deps: bool,
    /// Allow hook scripts outside the recipe directory
    pub trust_hooks: bool,
    /// Remove files from a previous version not present in the new one
    pub delete_extraneous: bool,

    pub compression: Compression,

    pub log_level: log::LevelFilter,
    pub log_max_bytes: u64,
    pub log_keep: usize,
    pub compress_rotated_logs: bool,
}

impl Config {
    /// Resolve configuration from defaults, the environment, and an
    /// optional explicit target root
    pub fn load(root_override: Option<PathBuf>) -> Result<Self, Error> {
        let target_root = root_override
            .or_else(|| env_path("LFS_ROOT"))
            .unwrap_or_else(|| PathBuf::from("/"));

        let prefix = state_prefix(&target_root)?;

        let mut config = Self {
            recipe_roots: env_paths("CAIRN_RECIPE_ROOTS")
                .unwrap_or_else(|| vec![prefix.join("recipes")]),
            sources_dir: prefix.join("sources/cache"),
            binaries_dir: prefix.join("binaries/cache"),
            manifests_dir: prefix.join("manifests"),
            state_dir: prefix.join("state"),
            locks_dir: prefix.join("locks"),
            logs_dir: prefix.join("logs"),
            sandbox_dir: prefix.join("build"),
            target_root,

            recipe_backups_keep: env_parse("CAIRN_RECIPE_BACKUPS").unwrap_or(5),
            db_backups_keep: env_parse("CAIRN_DB_BACKUPS").unwrap_or(5),
            artifact_keep_per_package: env_parse("CAIRN_CACHE_KEEP").unwrap_or(2),
            artifact_retention_days: env_parse("CAIRN_CACHE_RETENTION_DAYS").unwrap_or(30),
            source_retention_days: env_parse("CAIRN_SOURCE_RETENTION_DAYS").unwrap_or(90),

            mirrors: mirrors()?,
            fetch_attempts: env_parse("CAIRN_FETCH_ATTEMPTS").unwrap_or(3),
            backoff_base: Duration::from_secs(env_parse("CAIRN_BACKOFF_BASE").unwrap_or(2)),
            backoff_cap: Duration::from_secs(env_parse("CAIRN_BACKOFF_CAP").unwrap_or(60)),
            connect_timeout: Duration::from_secs(env_parse("CAIRN_CONNECT_TIMEOUT").unwrap_or(30)),
            fetch_timeout: Duration::from_secs(env_parse("CAIRN_FETCH_TIMEOUT").unwrap_or(1800)),
            source_min_bytes: env_parse("CAIRN_SOURCE_MIN_BYTES").unwrap_or(256),

            stage_timeout: Duration::from_secs(env_parse("CAIRN_STAGE_TIMEOUT").unwrap_or(3600)),
            jobs: env_parse("BUILD_JOBS").unwrap_or_else(|| util::num_cpus().get()),
            workers: env_parse("CAIRN_WORKERS").unwrap_or(1),
            retries: env_parse("RETRY").unwrap_or(0),
            fail_policy: fail_policy(),
            modified_policy: env_enum("CAIRN_MODIFIED_POLICY"),
            dry_run: env_flag("DRY_RUN"),
            strict_deps: env_flag("CAIRN_STRICT_DEPS"),
            trust_hooks: env_flag("CAIRN_TRUST_HOOKS"),
            delete_extraneous: env_flag("CAIRN_DELETE_EXTRANEOUS"),

            compression: env_enum("CAIRN_COMPRESSION"),

            log_level: log_level(),
            log_max_bytes: env_parse("CAIRN_LOG_MAX_BYTES").unwrap_or(4 * 1024 * 1024),
            log_keep: env_parse("CAIRN_LOG_KEEP").unwrap_or(3),
            compress_rotated_logs: env_flag("CAIRN_LOG_COMPRESS"),
        };

        if config.workers == 0 {
            config.workers = 1;
        }

        for dir in [
            &config.sources_dir,
            &config.binaries_dir,
            &config.manifests_dir,
            &config.state_dir,
            &config.locks_dir,
            &config.logs_dir,
            &config.sandbox_dir,
        ] {
            util::ensure_dir_exists(dir)?;
        }

        Ok(config)
    }
}

/// Root installs keep state under /var; everyone else gets
/// an XDG cache subtree
fn state_prefix(target_root: &PathBuf) -> Result<PathBuf, Error> {
    if let Some(prefix) = env_path("CAIRN_PREFIX") {
        return Ok(prefix);
    }

    if util::is_root() {
        Ok(target_root.join("var/lib/cairn"))
    } else {
        Ok(dirs::cache_dir().ok_or(Error::UserCache)?.join("cairn"))
    }
}

fn mirrors() -> Result<Vec<Url>, Error> {
    let Ok(raw) = std::env::var("CAIRN_MIRRORS") else {
        return Ok(vec![]);
    };

    raw.split_whitespace()
        .map(|s| Url::parse(s).map_err(|_| Error::InvalidMirror(s.to_owned())))
        .collect()
}

fn fail_policy() -> FailPolicy {
    if env_flag("CONTINUE_ON_ERROR") {
        FailPolicy::Continue
    } else if env_flag("ABORT_ON_ERROR") {
        FailPolicy::Abort
    } else {
        FailPolicy::default()
    }
}

fn log_level() -> log::LevelFilter {
    if env_flag("SILENT_ERRORS") {
        return log::LevelFilter::Off;
    }

    std::env::var("CAIRN_LOG_LEVEL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(log::LevelFilter::Info)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key).map(PathBuf::from)
}

fn env_paths(key: &str) -> Option<Vec<PathBuf>> {
    let raw = std::env::var(key).ok()?;
    Some(raw.split(':').map(PathBuf::from).collect())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).as_deref(),
        Ok("1" | "true" | "yes" | "on")
    )
}

fn env_enum<T: std::str::FromStr + Default>(key: &str) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find cache dir, $XDG_CACHE_HOME or $HOME env not set")]
    UserCache,
    #[error("invalid mirror url {0:?}")]
    InvalidMirror(String),
    #[error("io")]
    Io(#[from] io::Error),
}
