// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The registry of installed packages.
//!
//! Three files under the state directory, replaced atomically as a set
//! on every mutation: `installed.db` (`name=version` per line),
//! `depends.db` (`name: dep1 dep2 …`) and `installed.json` carrying the
//! full records (dependency classes, manifest reference, install time).
//! Each mutation backs the files up with a timestamped suffix; startup
//! restores from the newest backup when the registry is missing or
//! unreadable.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{config::Config, lock};

const INSTALLED: &str = "installed.db";
const DEPENDS: &str = "depends.db";
const RECORDS: &str = "installed.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub build_deps: Vec<String>,
    #[serde(default)]
    pub opt_deps: Vec<String>,
    /// Manifest file name in force at install time
    pub manifest: String,
    /// RFC 3339 install timestamp
    pub installed_at: String,
}

#[derive(Debug)]
pub struct Db {
    dir: PathBuf,
    backups_keep: usize,
    locks: lock::Manager,
}

impl Db {
    /// Open the registry, recovering from backups if the previous
    /// process died between backup and rename
    pub fn open(config: &Config, locks: lock::Manager) -> Result<Self, Error> {
        let db = Self {
            dir: config.state_dir.clone(),
            backups_keep: config.db_backups_keep,
            locks,
        };

        for file in [INSTALLED, DEPENDS, RECORDS] {
            db.recover(file);
        }

        Ok(db)
    }

    /// Restore `file` from its newest backup when absent or unreadable
    fn recover(&self, file: &str) {
        let path = self.dir.join(file);

        let healthy = match file {
            RECORDS => fs::read_to_string(&path)
                .ok()
                .map(|text| serde_json::from_str::<Vec<Record>>(&text).is_ok())
                .unwrap_or(false),
            _ => path.is_file(),
        };

        if healthy {
            return;
        }

        if let Some(backup) = newest_backup(&path) {
            log::warn!("restoring {file} from {backup:?}");
            let _ = fs::copy(&backup, &path);
        }
    }

    pub fn mark_installed(&self, record: Record) -> Result<(), Error> {
        // Install order is preserved in the file: dependencies appear
        // before their dependants
        self.mutate(|records| {
            records.retain(|r| r.name != record.name);
            records.push(record.clone());
        })
    }

    /// Remove `name`, returning the old record so callers can clean
    /// up its files
    pub fn mark_uninstalled(&self, name: &str) -> Result<Option<Record>, Error> {
        let old = self.get(name)?;

        if old.is_some() {
            self.mutate(|records| records.retain(|r| r.name != name))?;
        }

        Ok(old)
    }

    pub fn check_installed(&self, name: &str) -> Result<Option<String>, Error> {
        Ok(self.get(name)?.map(|r| r.version))
    }

    pub fn get(&self, name: &str) -> Result<Option<Record>, Error> {
        Ok(self.list()?.into_iter().find(|r| r.name == name))
    }

    /// All records; reads tolerate a concurrent replace-via-rename by
    /// retrying once
    pub fn list(&self) -> Result<Vec<Record>, Error> {
        let path = self.dir.join(RECORDS);

        if !path.exists() {
            return Ok(vec![]);
        }

        let read = || -> Result<Vec<Record>, Error> {
            let text = fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&text)?)
        };

        match read() {
            Ok(records) => Ok(records),
            Err(_) => read(),
        }
    }

    pub fn depends_of(&self, name: &str) -> Result<Vec<String>, Error> {
        Ok(self.get(name)?.map(|r| r.depends).unwrap_or_default())
    }

    /// Installed packages whose runtime dependencies include `name`
    pub fn required_by(&self, name: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|r| r.depends.iter().any(|d| d == name))
            .map(|r| r.name)
            .collect())
    }

    /// Apply `change` to the record set and persist all three files
    /// atomically, serialized by the installed-db lock
    fn mutate(&self, change: impl Fn(&mut Vec<Record>)) -> Result<(), Error> {
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let _guard = self.locks.acquire(
            lock::name::INSTALLED_DB,
            Duration::from_secs(60),
            &cancel,
        )?;

        let mut records = self.list()?;
        change(&mut records);

        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f").to_string();

        let render_installed = records
            .iter()
            .map(|r| format!("{}={}\n", r.name, r.version))
            .collect::<String>();
        let render_depends = records
            .iter()
            .map(|r| format!("{}: {}\n", r.name, r.depends.join(" ")))
            .collect::<String>();
        let render_records = serde_json::to_string_pretty(&records)?;

        for (file, content) in [
            (INSTALLED, render_installed),
            (DEPENDS, render_depends),
            (RECORDS, render_records),
        ] {
            let path = self.dir.join(file);

            if path.exists() {
                fs::copy(&path, backup_path(&path, &stamp))?;
                prune_backups(&path, self.backups_keep);
            }

            let temp = self.dir.join(format!("{file}.tmp-{}", std::process::id()));
            fs::write(&temp, &content)?;
            fs::rename(&temp, &path)?;
        }

        Ok(())
    }
}

fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{stamp}.bak"))
}

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
                .is_some_and(|n| n.starts_with(&format!("{stem}.")) && n.ends_with(".bak"))
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

#[derive(Debug, Error)]
pub enum Error {
    #[error("corrupt registry")]
    Corrupt(#[from] serde_json::Error),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn db(dir: &Path) -> Db {
        let mut config = Config::load(Some(dir.to_path_buf())).unwrap();
        config.state_dir = dir.join("state");
        fs::create_dir_all(&config.state_dir).unwrap();
        Db::open(&config, lock::Manager::new(dir.join("locks"))).unwrap()
    }

    fn record(name: &str, version: &str, depends: &[&str]) -> Record {
        Record {
            name: name.to_owned(),
            version: version.to_owned(),
            depends: depends.iter().map(|s| (*s).to_owned()).collect(),
            build_deps: vec![],
            opt_deps: vec![],
            manifest: format!("{name}-{version}-0.manifest"),
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn install_uninstall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());

        db.mark_installed(record("hello", "1.0", &[])).unwrap();
        assert_eq!(
            db.check_installed("hello").unwrap().as_deref(),
            Some("1.0")
        );

        // installed.db carries the documented line format
        let text = fs::read_to_string(dir.path().join("state").join(INSTALLED)).unwrap();
        assert!(text.contains("hello=1.0\n"));

        let old = db.mark_uninstalled("hello").unwrap();
        assert_eq!(old.unwrap().version, "1.0");
        assert_eq!(db.check_installed("hello").unwrap(), None);
    }

    #[test]
    fn upgrade_replaces_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());

        db.mark_installed(record("gcc", "12.2.0", &["glibc"])).unwrap();
        db.mark_installed(record("gcc", "12.3.0", &["glibc"])).unwrap();

        let records = db.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, "12.3.0");
    }

    #[test]
    fn reverse_dependency_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());

        db.mark_installed(record("b", "1", &[])).unwrap();
        db.mark_installed(record("a", "1", &["b"])).unwrap();

        assert_eq!(db.depends_of("a").unwrap(), vec!["b"]);
        assert_eq!(db.required_by("b").unwrap(), vec!["a"]);
        assert!(db.required_by("a").unwrap().is_empty());
    }

    #[test]
    fn recovery_restores_newest_backup() {
        let dir = tempfile::tempdir().unwrap();
        let db = db(dir.path());

        db.mark_installed(record("hello", "1.0", &[])).unwrap();
        // Second mutation creates backups of the populated registry
        db.mark_installed(record("zlib", "1.3", &[])).unwrap();

        // Simulate a crash that corrupted the records file
        let records = dir.path().join("state").join(RECORDS);
        fs::write(&records, "{ not json").unwrap();

        let mut config = Config::load(Some(dir.path().to_path_buf())).unwrap();
        config.state_dir = dir.path().join("state");
        let reopened =
            Db::open(&config, lock::Manager::new(dir.path().join("locks"))).unwrap();

        // The backup held only `hello`
        assert_eq!(
            reopened.check_installed("hello").unwrap().as_deref(),
            Some("1.0")
        );
    }
}
