// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Structured, size-rotated file logging.
//!
//! Every line reads `<ISO-8601 UTC> [LEVEL] <tag> <pid> <message>` and is
//! appended to both the global log and a per-tag log. Writers serialize
//! through per-file advisory locks so concurrent builds never interleave
//! within a line; rotation is serialized by its own named lock. A sink
//! that cannot reach its files degrades to stderr rather than failing
//! the caller.

use std::{
    fmt, io,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
    sync::Arc,
    time::Duration,
};

use fs_err as fs;
use fs_err::File;
use nix::fcntl::{Flock, FlockArg};
use regex::Regex;

use crate::{config::Config, lock};

/// Keys whose values are masked in emitted lines
const SENSITIVE_KEYS: &[&str] = &["password", "secret", "token", "api_key", "auth", "key"];

const GLOBAL_LOG: &str = "cairn.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace | log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: PathBuf,
    floor: log::LevelFilter,
    max_bytes: u64,
    keep: usize,
    compress: bool,
    mask: Regex,
    locks: lock::Manager,
}

impl LogSink {
    pub fn new(config: &Config, locks: lock::Manager) -> Self {
        let keys = SENSITIVE_KEYS.join("|");
        let mask = Regex::new(&format!(r"(?i)\b({keys})\b(\s*[=:]\s*|\s+)(\S+)"))
            .expect("static mask pattern");

        Self {
            inner: Arc::new(Inner {
                dir: config.logs_dir.clone(),
                floor: config.log_level,
                max_bytes: config.log_max_bytes,
                keep: config.log_keep,
                compress: config.compress_rotated_logs,
                mask,
                locks,
            }),
        }
    }

    /// Install a clone of this sink as the `log` facade backend
    pub fn install(&self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.inner.floor);
        log::set_boxed_logger(Box::new(self.clone()))
    }

    /// Emit a line to the global log and the per-tag log
    pub fn write(&self, level: Level, tag: &str, message: impl fmt::Display) {
        let inner = &self.inner;

        if !level_enabled(level, inner.floor) {
            return;
        }

        let message = message.to_string();
        let masked = inner.mask.replace_all(&message, "$1$2****");
        let line = format!(
            "{} [{level}] {tag} {} {masked}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            std::process::id(),
        );

        for name in [GLOBAL_LOG.to_owned(), format!("{}.log", sanitize(tag))] {
            let path = inner.dir.join(name);
            if let Err(e) = self.append(&path, &line) {
                // Never fail the caller over logging
                eprintln!("logsink: {e}: {}", line.trim_end());
            }
        }
    }

    fn append(&self, path: &Path, line: &str) -> io::Result<()> {
        self.rotate_if_needed(path);

        let file = File::options().create(true).append(true).open(path)?;

        // Per-file advisory lock keeps concurrent writers whole-line
        match Flock::lock(file.into_parts().0, FlockArg::LockExclusive) {
            Ok(mut locked) => {
                locked.write_all(line.as_bytes())?;
                locked.flush()?;
            }
            Err((mut unlocked, _)) => {
                // Lock unsupported: a single append write is still
                // atomic enough for O_APPEND
                unlocked.write_all(line.as_bytes())?;
                unlocked.flush()?;
            }
        }

        Ok(())
    }

    /// Shift `<name>` to `<name>.1`, … up to the kept-copies cap,
    /// serialized against other rotators
    fn rotate_if_needed(&self, path: &Path) {
        let inner = &self.inner;

        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size < inner.max_bytes {
            return;
        }

        let cancel = AtomicBool::new(false);
        let Ok(_guard) = inner
            .locks
            .acquire(lock::name::LOG_ROTATE, Duration::from_secs(10), &cancel)
        else {
            return;
        };

        // Re-check under the lock; another writer may have rotated
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size < inner.max_bytes {
            return;
        }

        for index in (1..inner.keep).rev() {
            for suffix in ["", ".gz"] {
                let from = rotated(path, index, suffix);
                if from.exists() {
                    let _ = fs::rename(&from, rotated(path, index + 1, suffix));
                }
            }
        }

        let _ = fs::rename(path, rotated(path, 1, ""));

        // Everything past the cap is dropped
        for suffix in ["", ".gz"] {
            let _ = fs::remove_file(rotated(path, inner.keep + 1, suffix));
        }

        if inner.compress {
            let _ = gzip_in_place(&rotated(path, 2, ""));
        }
    }
}

fn level_enabled(level: Level, floor: log::LevelFilter) -> bool {
    let needed = match level {
        Level::Debug => log::LevelFilter::Debug,
        Level::Info => log::LevelFilter::Info,
        Level::Warn => log::LevelFilter::Warn,
        Level::Error | Level::Fatal => log::LevelFilter::Error,
    };

    needed <= floor
}

fn rotated(path: &Path, index: usize, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{index}{suffix}"))
}

fn gzip_in_place(path: &Path) -> io::Result<()> {
    use flate2::{write::GzEncoder, Compression};

    if !path.exists() {
        return Ok(());
    }

    let mut input = File::open(path)?;
    let output = File::create(path.with_extension(
        format!(
            "{}.gz",
            path.extension().and_then(|e| e.to_str()).unwrap_or("log")
        ),
    ))?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;

    fs::remove_file(path)?;

    Ok(())
}

/// Tags become file names; keep them flat
fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| match c {
            '/' | ':' | ' ' => '-',
            c => c,
        })
        .collect()
}

impl log::Log for LogSink {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.inner.floor
    }

    fn log(&self, record: &log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tag = record.target().rsplit("::").next().unwrap_or("cairn");
        self.write(record.level().into(), tag, record.args());
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn sink(dir: &Path, max_bytes: u64) -> LogSink {
        let mut config = test_config(dir);
        config.log_max_bytes = max_bytes;
        LogSink::new(&config, lock::Manager::new(dir.join("locks")))
    }

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::load(Some(dir.to_path_buf())).unwrap();
        config.logs_dir = dir.to_path_buf();
        config.log_level = log::LevelFilter::Debug;
        config
    }

    #[test]
    fn lines_carry_structure_and_land_in_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), u64::MAX);

        sink.write(Level::Info, "fetch", "downloaded hello-1.0.tar.gz");

        let global = fs::read_to_string(dir.path().join(GLOBAL_LOG)).unwrap();
        let tagged = fs::read_to_string(dir.path().join("fetch.log")).unwrap();

        for content in [&global, &tagged] {
            assert!(content.contains("[INFO] fetch"));
            assert!(content.contains("downloaded hello-1.0.tar.gz"));
            assert!(content.ends_with('\n'));
        }
    }

    #[test]
    fn sensitive_values_are_masked() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), u64::MAX);

        sink.write(Level::Warn, "auth", "using token=hunter2 for mirror");

        let global = fs::read_to_string(dir.path().join(GLOBAL_LOG)).unwrap();
        assert!(global.contains("token=****"));
        assert!(!global.contains("hunter2"));
    }

    #[test]
    fn floor_drops_lower_levels() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.log_level = log::LevelFilter::Warn;
        let sink = LogSink::new(&config, lock::Manager::new(dir.path().join("locks")));

        sink.write(Level::Debug, "quiet", "should not appear");
        assert!(!dir.path().join(GLOBAL_LOG).exists());

        sink.write(Level::Error, "quiet", "should appear");
        assert!(dir.path().join(GLOBAL_LOG).exists());
    }

    #[test]
    fn rotation_renames_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink(dir.path(), 64);

        for i in 0..40 {
            sink.write(Level::Info, "rotate", format!("line {i} padding padding"));
        }

        assert!(dir.path().join(GLOBAL_LOG).exists());
        assert!(dir.path().join(format!("{GLOBAL_LOG}.1")).exists());
    }
}
