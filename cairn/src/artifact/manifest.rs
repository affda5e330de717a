// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Content manifests: the ordered `(sha256, ./relative-path)` records
//! describing every regular file an artifact installs.
//!
//! Manifests are the identity of an artifact. Two staged trees with
//! equal manifests are the same package content, which is what makes
//! cache deduplication and install verification possible.

use std::{
    io,
    path::{Path, PathBuf},
};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;

use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub sha256: String,
    /// Normalized to `./`-prefixed form
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    entries: Vec<Entry>,
}

impl Manifest {
    /// Hash every regular file under `tree`, ordered by path
    pub fn compute(tree: &Path) -> Result<Self, Error> {
        let mut files = util::enumerate_files(tree, |_| true)?;
        files.sort();

        let entries = files
            .par_iter()
            .map(|file| {
                let sha256 = util::hash_file(file)?;
                Ok(Entry {
                    sha256,
                    path: normalize(tree, file),
                })
            })
            .collect::<Result<Vec<_>, io::Error>>()?;

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// One line per file: `<sha256>  ./<relpath>`
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!("{}  {}\n", entry.sha256, entry.path));
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut entries = vec![];

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((sha256, path)) = line.split_once("  ") else {
                return Err(Error::Malformed(idx + 1));
            };

            if sha256.len() != 64 || !sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Malformed(idx + 1));
            }

            let entry = Entry {
                sha256: sha256.to_owned(),
                path: path.trim().to_owned(),
            };

            if entries.iter().any(|e: &Entry| e.path == entry.path) {
                return Err(Error::Duplicate(entry.path));
            }

            entries.push(entry);
        }

        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs_err::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Paths present here but absent from `other`
    pub fn paths_removed_in(&self, other: &Manifest) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| !other.entries.iter().any(|e| e.path == entry.path))
            .map(|entry| entry.path.as_str())
            .collect()
    }

    /// Resolve an entry path under a target root
    pub fn target_path(root: &Path, entry_path: &str) -> PathBuf {
        root.join(entry_path.trim_start_matches("./"))
    }
}

fn normalize(tree: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(tree).unwrap_or(file);
    format!("./{}", relative.display())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("manifest line {0} is malformed")]
    Malformed(usize),
    #[error("duplicate manifest path {0}")]
    Duplicate(String),
    #[error("io")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod test {
    use super::*;
    use fs_err as fs;

    fn stage(dir: &Path, files: &[(&str, &str)]) {
        for (path, content) in files {
            let full = dir.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    #[test]
    fn compute_is_ordered_and_normalized() {
        let dir = tempfile::tempdir().unwrap();
        stage(
            dir.path(),
            &[
                ("usr/bin/hello", "binary"),
                ("usr/share/doc/hello/README", "docs"),
                ("etc/hello.conf", "conf"),
            ],
        );

        let manifest = Manifest::compute(dir.path()).unwrap();
        let paths: Vec<_> = manifest.entries().iter().map(|e| e.path.as_str()).collect();

        assert_eq!(
            paths,
            vec![
                "./etc/hello.conf",
                "./usr/bin/hello",
                "./usr/share/doc/hello/README"
            ]
        );
    }

    #[test]
    fn render_parse_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        stage(dir.path(), &[("usr/bin/a", "a"), ("usr/bin/b", "b")]);

        let manifest = Manifest::compute(dir.path()).unwrap();
        let parsed = Manifest::parse(&manifest.render()).unwrap();

        assert_eq!(manifest, parsed);
    }

    #[test]
    fn identical_trees_produce_identical_manifests() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        for dir in [&a, &b] {
            stage(dir.path(), &[("usr/bin/tool", "same bytes"), ("etc/cfg", "x")]);
        }

        assert_eq!(
            Manifest::compute(a.path()).unwrap().render(),
            Manifest::compute(b.path()).unwrap().render()
        );
    }

    #[test]
    fn duplicates_rejected() {
        let text = "0000000000000000000000000000000000000000000000000000000000000000  ./a\n\
                    1111111111111111111111111111111111111111111111111111111111111111  ./a\n";
        assert!(matches!(
            Manifest::parse(text),
            Err(Error::Duplicate(_))
        ));
    }
}
