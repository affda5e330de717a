// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Recipe discovery, parsing and editing.
//!
//! Recipes are searched across an ordered list of root directories,
//! first root wins. Parsed documents are cached by content hash, so any
//! on-disk change naturally invalidates. All writes funnel through
//! [`Store::update_atomic`]: timestamped backup, temp sibling, rename.

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use fs_err as fs;
use thiserror::Error;

use crate::{lock, util};

/// Retained beside the recipe on every write: `<name>.ini.<ts>.bak`
const BACKUP_SUFFIX: &str = "bak";

/// A parsed recipe together with its provenance
#[derive(Debug)]
pub struct Loaded {
    pub path: PathBuf,
    pub source: String,
    pub document: metafile::Document,
    pub parsed: metafile::Recipe,
    /// sha256 of `source`, the cache key
    pub content_hash: String,
}

impl Loaded {
    pub fn name(&self) -> &str {
        &self.parsed.name
    }

    pub fn version(&self) -> Option<&str> {
        self.parsed.version.as_deref()
    }

    /// Directory hook paths resolve against
    pub fn dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}

#[derive(Debug)]
pub struct Store {
    roots: Vec<PathBuf>,
    backups_keep: usize,
    locks: lock::Manager,
    cache: Mutex<HashMap<String, Arc<Loaded>>>,
}

impl Store {
    pub fn new(roots: Vec<PathBuf>, backups_keep: usize, locks: lock::Manager) -> Self {
        Self {
            roots,
            backups_keep,
            locks,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Locate `<name>.ini`, `<name>/<name>.ini` or `<dir>/*<name>*.ini`
    /// across the configured roots, first match wins.
    ///
    /// Duplicates in later roots are logged, never returned.
    pub fn find(&self, name: &str) -> Result<PathBuf, Error> {
        let matches = self.find_all(name);

        if matches.len() > 1 {
            log::warn!(
                "recipe `{name}` found in multiple roots, using {:?} over {:?}",
                matches[0],
                &matches[1..]
            );
        }

        matches
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }

    fn find_all(&self, name: &str) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = vec![];
        let mut push = |candidate: PathBuf, found: &mut Vec<PathBuf>| {
            if candidate.is_file() && !found.contains(&candidate) {
                found.push(candidate);
            }
        };

        for root in &self.roots {
            push(root.join(format!("{name}.ini")), &mut found);
            push(root.join(name).join(format!("{name}.ini")), &mut found);

            let pattern = format!("{}/**/*{name}*.ini", root.display());
            if let Ok(paths) = glob::glob(&pattern) {
                for path in paths.flatten() {
                    push(path, &mut found);
                }
            }
        }

        found
    }

    /// Load and parse, serving repeats from the content-hash cache
    pub fn load(&self, path: &Path) -> Result<Arc<Loaded>, Error> {
        let source = fs::read_to_string(path).map_err(|_| Error::Missing(path.to_path_buf()))?;
        let content_hash = util::hash_bytes(source.as_bytes());

        if let Some(hit) = self.cache.lock().unwrap().get(&content_hash) {
            return Ok(hit.clone());
        }

        let document = metafile::parse(&source).map_err(|error| Error::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        let parsed = metafile::Recipe::from_document(&document).map_err(|error| Error::Parse {
            path: path.to_path_buf(),
            error: error.into(),
        })?;

        let loaded = Arc::new(Loaded {
            path: path.to_path_buf(),
            source,
            document,
            parsed,
            content_hash: content_hash.clone(),
        });

        self.cache
            .lock()
            .unwrap()
            .insert(content_hash, loaded.clone());

        Ok(loaded)
    }

    pub fn load_by_name(&self, name: &str) -> Result<Arc<Loaded>, Error> {
        let path = self.find(name)?;
        self.load(&path)
    }

    /// Enumerate recipe files under one root, or all of them
    pub fn list(&self, root: Option<&Path>) -> Result<Vec<PathBuf>, Error> {
        let roots: Vec<_> = match root {
            Some(root) => vec![root.to_path_buf()],
            None => self.roots.clone(),
        };

        let mut out = vec![];
        for root in roots {
            if !root.exists() {
                continue;
            }
            out.extend(util::enumerate_files(&root, |p| {
                p.extension().is_some_and(|e| e == "ini")
            })?);
        }

        out.sort();
        Ok(out)
    }

    /// Field-level read by dotted name
    pub fn get(&self, path: &Path, field: &str) -> Result<String, Error> {
        let loaded = self.load(path)?;

        loaded
            .document
            .get(field)
            .map(str::to_owned)
            .ok_or_else(|| Error::NoSuchField(field.to_owned()))
    }

    /// Field-level write through [`Self::update_atomic`]
    pub fn set(&self, path: &Path, field: &str, value: &str) -> Result<(), Error> {
        self.update_atomic(path, &[(field.to_owned(), value.to_owned())])
    }

    /// Apply `updates` (dotted name → value) with backup and
    /// atomic replacement.
    ///
    /// On any failure the newest backup is restored and `WriteFailed`
    /// reported.
    pub fn update_atomic(&self, path: &Path, updates: &[(String, String)]) -> Result<(), Error> {
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let _guard = self
            .locks
            .acquire(lock::name::RECIPE_STORE, Duration::from_secs(30), &cancel)?;

        let source = fs::read_to_string(path).map_err(|_| Error::Missing(path.to_path_buf()))?;

        let mut updater = metafile::Updater::new();
        for (field, value) in updates {
            updater.set_dotted(field, value);
        }
        let updated = updater.apply(&source);

        // Millisecond resolution: successive edits within one second
        // must not clobber each other's backups
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string();
        let backup = backup_path(path, &stamp);

        let write = || -> io::Result<()> {
            fs::copy(path, &backup)?;

            let temp = path.with_extension(format!("tmp.{}", std::process::id()));
            fs::write(&temp, &updated)?;
            fs::rename(&temp, path)?;

            Ok(())
        };

        if let Err(error) = write() {
            // Restore whatever still parses from the newest backup
            if let Some(newest) = newest_backup(path) {
                let _ = fs::copy(&newest, path);
            }
            return Err(Error::WriteFailed {
                path: path.to_path_buf(),
                error,
            });
        }

        prune_backups(path, self.backups_keep);

        Ok(())
    }

    /// Enforce the structural rules a recipe must satisfy before it
    /// can be built. Fatal problems surface as `Validation`; the
    /// returned issues are warnings.
    pub fn validate(&self, loaded: &Loaded) -> Result<Vec<Issue>, Error> {
        let recipe = &loaded.parsed;
        let mut warnings = vec![];

        if recipe.sources.is_empty() && recipe.sources_dir.is_none() {
            return Err(Error::Validation(vec![format!(
                "recipe `{}` declares no sources and no sources directory",
                recipe.name
            )]));
        }

        if recipe.version.is_none() {
            warnings.push(Issue::MissingVersion);
        }

        for source in &recipe.sources {
            if source.sha256.is_none() && source.uri.scheme() != "git" {
                warnings.push(Issue::MissingChecksum(source.index));
            }
        }

        Ok(warnings)
    }

    /// Materialize a starter recipe at its canonical location.
    /// Refuses to overwrite.
    pub fn create(
        &self,
        category: &str,
        name: &str,
        sub: Option<&str>,
    ) -> Result<PathBuf, Error> {
        let root = self.roots.first().ok_or(Error::NoRoots)?;

        let mut dir = root.join(category);
        if let Some(sub) = sub {
            dir = dir.join(sub);
        }
        dir = dir.join(name);

        let path = dir.join(format!("{name}.ini"));

        if path.exists() {
            return Err(Error::AlreadyExists(path));
        }

        fs::create_dir_all(&dir)?;
        fs::write(&path, starter(name, category))?;

        Ok(path)
    }

    /// Recover a recipe from its newest timestamped backup
    pub fn restore(&self, path: &Path) -> Result<PathBuf, Error> {
        let backup = newest_backup(path).ok_or_else(|| Error::NoBackup(path.to_path_buf()))?;

        fs::copy(&backup, path).map_err(|error| Error::WriteFailed {
            path: path.to_path_buf(),
            error,
        })?;

        Ok(backup)
    }

    /// Drop backups beyond `keep`, newest retained
    pub fn backup_clean(&self, path: &Path, keep: usize) -> Result<usize, Error> {
        let before = backups(path).len();
        prune_backups(path, keep);
        Ok(before.saturating_sub(backups(path).len()))
    }

    /// Line-level differences between a recipe and its newest backup
    pub fn diff(&self, path: &Path) -> Result<String, Error> {
        let backup = newest_backup(path).ok_or_else(|| Error::NoBackup(path.to_path_buf()))?;

        let old = fs::read_to_string(&backup)?;
        let new = fs::read_to_string(path)?;

        Ok(diff_lines(&old, &new))
    }
}

/// Naive positional diff; recipe edits preserve layout so this reads
/// like a unified diff in practice
fn diff_lines(old: &str, new: &str) -> String {
    let old: Vec<_> = old.lines().collect();
    let new: Vec<_> = new.lines().collect();
    let mut out = String::new();

    for i in 0..old.len().max(new.len()) {
        match (old.get(i), new.get(i)) {
            (Some(o), Some(n)) if o == n => {}
            (Some(o), Some(n)) => {
                out.push_str(&format!("-{o}\n+{n}\n"));
            }
            (Some(o), None) => out.push_str(&format!("-{o}\n")),
            (None, Some(n)) => out.push_str(&format!("+{n}\n")),
            (None, None) => {}
        }
    }

    out
}

fn backup_path(path: &Path, timestamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{timestamp}.{BACKUP_SUFFIX}"))
}

/// All backups for `path`, oldest first (timestamps sort
/// lexicographically)
fn backups(path: &Path) -> Vec<PathBuf> {
    let Some(parent) = path.parent() else {
        return vec![];
    };
    let Some(stem) = path.file_name().and_then(|n| n.to_str()) else {
        return vec![];
    };

    let Ok(entries) = fs::read_dir(parent) else {
        return vec![];
    };

    let mut found: Vec<_> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&format!("{stem}.")) && n.ends_with(BACKUP_SUFFIX))
        })
        .collect();

    found.sort();
    found
}

fn newest_backup(path: &Path) -> Option<PathBuf> {
    backups(path).pop()
}

fn prune_backups(path: &Path, keep: usize) {
    let found = backups(path);

    if found.len() > keep {
        for stale in &found[..found.len() - keep] {
            let _ = fs::remove_file(stale);
        }
    }
}

fn starter(name: &str, category: &str) -> String {
    format!(
        r#"[package]
name = {name}
version = 0.0.0
category = {category}
description =
homepage =

[sources]
url_1 =
sha256_1 =

[deps]
depends =
build_deps =

[build]
system = auto
"#
    )
}

/// Non-fatal findings from [`Store::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    MissingVersion,
    MissingChecksum(usize),
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Issue::MissingVersion => "missing `version`".fmt(f),
            Issue::MissingChecksum(index) => {
                write!(f, "source url_{index} has no sha256 recorded")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("no recipe found for `{0}`")]
    NotFound(String),
    #[error("recipe file does not exist: {0:?}")]
    Missing(PathBuf),
    #[error("parse {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        error: metafile::Error,
    },
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("write failed for {path:?}, original restored")]
    WriteFailed {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
    #[error("refusing to overwrite existing recipe {0:?}")]
    AlreadyExists(PathBuf),
    #[error("no backup exists for {0:?}")]
    NoBackup(PathBuf),
    #[error("no recipe roots configured")]
    NoRoots,
    #[error("no field `{0}`")]
    NoSuchField(String),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn store(root: &Path) -> Store {
        Store::new(
            vec![root.to_path_buf()],
            3,
            lock::Manager::new(root.join(".locks")),
        )
    }

    fn write_recipe(root: &Path, name: &str, body: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.ini"));
        fs::write(&path, body).unwrap();
        path
    }

    const HELLO: &str = r#"[package]
name = hello
version = 1.0

[sources]
url_1 = https://example.com/hello-1.0.tar.gz
sha256_1 = cafe
"#;

    #[test]
    fn find_prefers_first_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        write_recipe(a.path(), "hello", HELLO);
        write_recipe(b.path(), "hello", HELLO);

        let store = Store::new(
            vec![a.path().to_path_buf(), b.path().to_path_buf()],
            3,
            lock::Manager::new(a.path().join(".locks")),
        );

        let found = store.find("hello").unwrap();
        assert!(found.starts_with(a.path()));
    }

    #[test]
    fn load_caches_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_recipe(dir.path(), "hello", HELLO);
        let store = store(dir.path());

        let first = store.load(&path).unwrap();
        let second = store.load(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Content change busts the cache
        fs::write(&path, HELLO.replace("1.0", "2.0")).unwrap();
        let third = store.load(&path).unwrap();
        assert_eq!(third.version(), Some("2.0"));
    }

    #[test]
    fn update_atomic_round_trips_and_backs_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_recipe(dir.path(), "hello", HELLO);
        let store = store(dir.path());

        store
            .update_atomic(
                &path,
                &[
                    ("package.version".to_owned(), "1.1".to_owned()),
                    ("sources.sha256_1".to_owned(), "beef".to_owned()),
                ],
            )
            .unwrap();

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded.version(), Some("1.1"));
        assert_eq!(loaded.parsed.sources[0].sha256.as_deref(), Some("beef"));

        // A backup of the pre-edit content exists
        let backup = newest_backup(&path).unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), HELLO);
    }

    #[test]
    fn restore_returns_backup_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_recipe(dir.path(), "hello", HELLO);
        let store = store(dir.path());

        store.set(&path, "package.version", "9.9").unwrap();
        store.restore(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), HELLO);
    }

    #[test]
    fn backups_pruned_to_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_recipe(dir.path(), "hello", HELLO);
        let store = store(dir.path());

        for i in 0..6 {
            store
                .set(&path, "package.version", &format!("1.{i}"))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        assert!(backups(&path).len() <= 3);
    }

    #[test]
    fn create_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let path = store.create("core", "zlib", None).unwrap();
        assert!(path.exists());

        assert!(matches!(
            store.create("core", "zlib", None),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn validate_warns_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let path = write_recipe(
            dir.path(),
            "nover",
            "[package]\nname = nover\n[sources]\nurl_1 = https://example.com/x.tar.gz\n",
        );
        let loaded = store.load(&path).unwrap();
        let issues = store.validate(&loaded).unwrap();
        assert!(issues.contains(&Issue::MissingVersion));
        assert!(issues.contains(&Issue::MissingChecksum(1)));

        let path = write_recipe(dir.path(), "empty", "[package]\nname = empty\n");
        let loaded = store.load(&path).unwrap();
        assert!(matches!(
            store.validate(&loaded),
            Err(Error::Validation(_))
        ));
    }
}
