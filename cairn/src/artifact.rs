// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The content-addressable binary artifact cache.
//!
//! A staged tree is described by its [`Manifest`] first; a byte-identical
//! manifest already in the cache short-circuits packing entirely. Fresh
//! artifacts are deterministic tarballs (sorted entries, numeric owner
//! 0/0, zero mtime) compressed per configuration and installed into the
//! cache by rename. Install, verify and remove work against a target
//! root purely through manifests.

use std::{
    collections::HashMap,
    io,
    io::Write,
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    time::Duration,
};

use fs_err as fs;
use fs_err::File;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    config::{Compression, Config, ModifiedPolicy},
    lock, util,
};

pub use self::manifest::Manifest;

pub mod manifest;

/// A packed artifact and its manifest, both resident in the cache
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: String,
    pub version: String,
    pub archive: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
    /// True when an existing cache entry satisfied the pack
    pub deduplicated: bool,
}

/// Result of verifying a manifest against a target root
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub missing: Vec<String>,
    pub modified: Vec<String>,
}

impl VerifyReport {
    pub fn clean(&self) -> bool {
        self.missing.is_empty() && self.modified.is_empty()
    }
}

/// Result of removing a package's files from a target root
#[derive(Debug, Clone, Default)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    /// Files whose content differed from the manifest, handled per
    /// the modified-files policy
    pub kept_modified: Vec<String>,
}

pub struct Store {
    binaries_dir: PathBuf,
    manifests_dir: PathBuf,
    compression: Compression,
    modified_policy: ModifiedPolicy,
    locks: lock::Manager,
}

impl Store {
    pub fn new(config: &Config, locks: lock::Manager) -> Self {
        Self {
            binaries_dir: config.binaries_dir.clone(),
            manifests_dir: config.manifests_dir.clone(),
            compression: config.compression,
            modified_policy: config.modified_policy,
            locks,
        }
    }

    /// Pack `staged_tree` for `(name, version)`.
    ///
    /// The manifest is computed first; when it matches an existing
    /// cached manifest byte-for-byte the cached artifact is reused and
    /// nothing is written.
    pub fn pack(&self, name: &str, version: &str, staged_tree: &Path) -> Result<Artifact, Error> {
        let _guard = self.cache_lock(name, version)?;

        let manifest = Manifest::compute(staged_tree)?;
        if manifest.is_empty() {
            return Err(Error::EmptyTree(staged_tree.to_path_buf()));
        }

        let rendered = manifest.render();

        // Dedup against every cached manifest
        if let Some(existing) = self.find_manifest_by_content(&rendered)? {
            if let Some(archive) = self.archive_for_stem(&stem_of(&existing)) {
                log::info!("{name} {version}: staged tree matches cached artifact, reusing");
                return Ok(Artifact {
                    name: name.to_owned(),
                    version: version.to_owned(),
                    archive,
                    manifest_path: existing,
                    manifest,
                    deduplicated: true,
                });
            }
        }

        let stem = format!("{name}-{version}-{}", util::timestamp());
        let archive = self
            .binaries_dir
            .join(format!("{stem}.{}", self.compression.extension()));
        let manifest_path = self.manifests_dir.join(format!("{stem}.manifest"));

        // Archive first, manifest last: a manifest only ever names a
        // complete archive
        let temp_archive = self.binaries_dir.join(format!("{stem}.tmp-{}", std::process::id()));
        if let Err(e) = self.write_archive(staged_tree, &temp_archive) {
            let _ = fs::remove_file(&temp_archive);
            return Err(e);
        }
        fs::rename(&temp_archive, &archive)?;

        let temp_manifest = self
            .manifests_dir
            .join(format!("{stem}.tmp-{}", std::process::id()));
        fs::write(&temp_manifest, &rendered)?;
        fs::rename(&temp_manifest, &manifest_path)?;

        Ok(Artifact {
            name: name.to_owned(),
            version: version.to_owned(),
            archive,
            manifest_path,
            manifest,
            deduplicated: false,
        })
    }

    /// Deterministic tar: sorted entries, uid/gid 0, mtime 0,
    /// permissions preserved
    fn write_archive(&self, tree: &Path, out_path: &Path) -> Result<(), Error> {
        let out = File::create(out_path)?;

        match self.compression {
            Compression::Zstd => {
                // Single-threaded for byte stability
                let encoder = zstd::stream::write::Encoder::new(out, 19)?;
                let encoder = self.append_entries(tree, encoder)?;
                encoder.finish()?.flush()?;
            }
            Compression::Xz => {
                let encoder = xz2::write::XzEncoder::new(out, 6);
                let encoder = self.append_entries(tree, encoder)?;
                encoder.finish()?.flush()?;
            }
            Compression::Gzip => {
                let encoder =
                    flate2::write::GzEncoder::new(out, flate2::Compression::default());
                let encoder = self.append_entries(tree, encoder)?;
                encoder.finish()?.flush()?;
            }
        }

        Ok(())
    }

    fn append_entries<W: Write>(&self, tree: &Path, out: W) -> Result<W, Error> {
        let mut builder = tar::Builder::new(out);
        builder.follow_symlinks(false);

        let mut paths = walk_all(tree)?;
        paths.sort();

        for path in paths {
            let relative = path.strip_prefix(tree).unwrap_or(&path);
            let meta = fs::symlink_metadata(&path)?;

            let mut header = tar::Header::new_gnu();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(0);
            header.set_mode(meta.mode() & 0o7777);

            if meta.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                builder.append_data(&mut header, relative, io::empty())?;
            } else if meta.is_symlink() {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                builder.append_link(&mut header, relative, fs::read_link(&path)?)?;
            } else {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(meta.len());
                builder.append_data(&mut header, relative, File::open(&path)?)?;
            }
        }

        Ok(builder.into_inner()?)
    }

    /// Best cached archive for `(name, version)`, newest first
    pub fn cache_check(&self, name: &str, version: &str) -> Option<PathBuf> {
        self.stems_for(name, Some(version))
            .into_iter()
            .next_back()
            .and_then(|stem| self.archive_for_stem(&stem))
    }

    /// Newest cached manifest for `name` (any version)
    pub fn latest_manifest(&self, name: &str) -> Option<PathBuf> {
        self.stems_for(name, None)
            .into_iter()
            .next_back()
            .map(|stem| self.manifests_dir.join(format!("{stem}.manifest")))
    }

    /// Install `(name, version)` from the cache into `target_root`.
    ///
    /// The archive is verified and unpacked into a private temporary
    /// directory under the target filesystem, then copied in. On any
    /// failure the partial install is undone from the manifest's file
    /// list. `previous` enables delete-extraneous semantics against the
    /// record of an older version.
    pub fn install(
        &self,
        name: &str,
        version: &str,
        target_root: &Path,
        delete_extraneous: bool,
        previous: Option<&Manifest>,
    ) -> Result<Manifest, Error> {
        let _guard = self.cache_lock(name, version)?;

        let archive = self
            .cache_check(name, version)
            .ok_or_else(|| Error::NotCached {
                name: name.to_owned(),
                version: version.to_owned(),
            })?;
        let manifest = Manifest::load(&self.manifest_sibling(&archive))?;

        util::ensure_dir_exists(target_root)?;

        // Private staging area on the same filesystem as the target
        let temp = tempfile::Builder::new()
            .prefix(".cairn-install-")
            .tempdir_in(target_root)?;

        unpack_archive(&archive, temp.path())?;

        // Every manifest entry must have arrived intact before a single
        // byte lands in the target root
        let staged_report = verify_tree(&manifest, temp.path())?;
        if !staged_report.clean() {
            return Err(Error::CorruptArtifact(archive));
        }

        let result = copy_tree(temp.path(), target_root);

        if let Err(e) = result {
            // Undo the partial install from the file list
            for entry in manifest.entries() {
                let _ = fs::remove_file(Manifest::target_path(target_root, &entry.path));
            }
            return Err(e);
        }

        if delete_extraneous {
            if let Some(previous) = previous {
                for stale in previous.paths_removed_in(&manifest) {
                    let target = Manifest::target_path(target_root, stale);
                    if target.exists() {
                        fs::remove_file(&target)?;
                    }
                }
            }
        }

        Ok(manifest)
    }

    /// Recompute hashes for every manifest entry beneath `target_root`
    pub fn verify(&self, manifest_path: &Path, target_root: &Path) -> Result<VerifyReport, Error> {
        let manifest = Manifest::load(manifest_path)?;
        verify_tree(&manifest, target_root)
    }

    /// Remove a package's files in reverse path order, pruning
    /// directories emptied along the way
    pub fn remove(&self, manifest_path: &Path, target_root: &Path) -> Result<RemoveReport, Error> {
        let manifest = Manifest::load(manifest_path)?;
        let mut report = RemoveReport::default();

        let mut entries: Vec<_> = manifest.entries().to_vec();
        entries.sort_by(|a, b| b.path.cmp(&a.path));

        for entry in &entries {
            let target = Manifest::target_path(target_root, &entry.path);

            if !target.exists() {
                continue;
            }

            let modified = util::hash_file(&target)
                .map(|got| got != entry.sha256)
                .unwrap_or(true);

            if modified {
                match self.modified_policy {
                    ModifiedPolicy::Keep => {
                        report.kept_modified.push(entry.path.clone());
                        continue;
                    }
                    ModifiedPolicy::Backup => {
                        let saved = target.with_extension(format!("saved.{}", util::timestamp()));
                        fs::rename(&target, &saved)?;
                        report.kept_modified.push(entry.path.clone());
                        continue;
                    }
                    ModifiedPolicy::Force => {}
                }
            }

            fs::remove_file(&target)?;
            report.removed.push(entry.path.clone());

            prune_empty_dirs(&target, target_root);
        }

        Ok(report)
    }

    /// Prune artifacts older than `retention_days`, always preserving
    /// the newest `keep_per_package` for each name
    pub fn gc(&self, retention_days: u64, keep_per_package: usize) -> Result<usize, Error> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(Duration::from_secs(retention_days * 24 * 3600));
        let Some(cutoff) = cutoff else { return Ok(0) };

        let mut by_name: HashMap<String, Vec<String>> = self
            .all_stems()
            .into_iter()
            .filter_map(|stem| split_stem(&stem).map(|(name, _, _)| (name, stem)))
            .into_group_map();

        let mut removed = 0;

        for stems in by_name.values_mut() {
            // Timestamps sort lexicographically: newest last
            stems.sort();

            let disposable = stems.len().saturating_sub(keep_per_package);
            for stem in stems.iter().take(disposable) {
                let Some(archive) = self.archive_for_stem(stem) else {
                    continue;
                };

                let stale = fs::metadata(&archive)
                    .and_then(|m| m.modified())
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);

                if stale {
                    fs::remove_file(&archive)?;
                    let _ = fs::remove_file(self.manifests_dir.join(format!("{stem}.manifest")));
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }

    fn cache_lock(&self, name: &str, version: &str) -> Result<lock::Lock, Error> {
        let cancel = std::sync::atomic::AtomicBool::new(false);
        Ok(self.locks.acquire(
            lock::name::cache_entry(name, version),
            Duration::from_secs(600),
            &cancel,
        )?)
    }

    fn manifest_sibling(&self, archive: &Path) -> PathBuf {
        self.manifests_dir
            .join(format!("{}.manifest", stem_of(archive)))
    }

    fn find_manifest_by_content(&self, rendered: &str) -> Result<Option<PathBuf>, Error> {
        let Ok(entries) = fs::read_dir(&self.manifests_dir) else {
            return Ok(None);
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("manifest") {
                continue;
            }
            if fs::read_to_string(&path).map(|t| t == rendered).unwrap_or(false) {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }

    fn archive_for_stem(&self, stem: &str) -> Option<PathBuf> {
        for compression in [Compression::Zstd, Compression::Xz, Compression::Gzip] {
            let candidate = self
                .binaries_dir
                .join(format!("{stem}.{}", compression.extension()));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    fn all_stems(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.manifests_dir) else {
            return vec![];
        };

        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".manifest").map(str::to_owned)
            })
            .collect()
    }

    /// Stems for `name` (optionally pinned to `version`), oldest first.
    /// Prefix matched so names and versions may themselves contain
    /// dashes; the trailing segment must be a pure-digit timestamp.
    fn stems_for(&self, name: &str, version: Option<&str>) -> Vec<String> {
        let prefix = match version {
            Some(version) => format!("{name}-{version}-"),
            None => format!("{name}-"),
        };

        let mut stems: Vec<_> = self
            .all_stems()
            .into_iter()
            .filter(|stem| {
                stem.strip_prefix(&prefix).is_some_and(|rest| {
                    let timestamp = rest.rsplit('-').next().unwrap_or(rest);
                    !timestamp.is_empty() && timestamp.chars().all(|c| c.is_ascii_digit())
                })
            })
            .collect();

        stems.sort();
        stems
    }
}

/// `<name>-<version>-<timestamp>` where the timestamp is all digits.
/// Names may contain dashes, so parse from the right.
fn split_stem(stem: &str) -> Option<(String, String, String)> {
    let (rest, timestamp) = stem.rsplit_once('-')?;
    if timestamp.is_empty() || !timestamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let (name, version) = rest.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }

    Some((name.to_owned(), version.to_owned(), timestamp.to_owned()))
}

fn stem_of(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    // Strip the full `.tar.*` / `.manifest` suffix
    name.split_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(name)
        .to_owned()
}

fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), Error> {
    crate::fetch::extract(archive, dest).map_err(|e| match e {
        crate::fetch::Error::Io(io) => Error::Io(io),
        other => {
            log::error!("unpacking {archive:?}: {other}");
            Error::CorruptArtifact(archive.to_path_buf())
        }
    })
}

fn verify_tree(manifest: &Manifest, root: &Path) -> Result<VerifyReport, Error> {
    let mut report = VerifyReport::default();

    for entry in manifest.entries() {
        let target = Manifest::target_path(root, &entry.path);

        if !target.exists() {
            report.missing.push(entry.path.clone());
            continue;
        }

        match util::hash_file(&target) {
            Ok(got) if got == entry.sha256 => {}
            _ => report.modified.push(entry.path.clone()),
        }
    }

    Ok(report)
}

/// Content-preserving recursive copy that leaves existing unrelated
/// files alone
fn copy_tree(from: &Path, to: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(from)?.flatten() {
        let source = entry.path();
        let file_name = entry.file_name();
        let target = to.join(&file_name);
        let meta = entry.metadata()?;

        if meta.is_dir() {
            util::ensure_dir_exists(&target)?;
            copy_tree(&source, &target)?;
        } else if meta.is_symlink() {
            let _ = fs::remove_file(&target);
            symlink(fs::read_link(&source)?, &target)?;
        } else {
            fs::copy(&source, &target)?;
            let perms = std::fs::Permissions::from_mode(meta.mode() & 0o7777);
            fs::set_permissions(&target, perms)?;
        }
    }

    Ok(())
}

/// Walk upward from a removed file, deleting directories that are now
/// empty, stopping at the target root
fn prune_empty_dirs(removed: &Path, root: &Path) {
    let mut current = removed.parent();

    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }

        let empty = fs::read_dir(dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);

        if !empty || fs::remove_dir(dir).is_err() {
            break;
        }

        current = dir.parent();
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("staged tree {0:?} contains no files")]
    EmptyTree(PathBuf),
    #[error("no cached artifact for {name} {version}")]
    NotCached { name: String, version: String },
    #[error("artifact failed verification: {0:?}")]
    CorruptArtifact(PathBuf),
    #[error("manifest")]
    Manifest(#[from] manifest::Error),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

/// Everything in the tree: files, directories and symlinks
fn walk_all(tree: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = vec![];
    let mut stack = vec![tree.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let meta = entry.metadata()?;

            out.push(path.clone());

            if meta.is_dir() {
                stack.push(path);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn store(dir: &Path) -> Store {
        let mut config = Config::load(Some(dir.to_path_buf())).unwrap();
        config.binaries_dir = dir.join("binaries");
        config.manifests_dir = dir.join("manifests");
        fs::create_dir_all(&config.binaries_dir).unwrap();
        fs::create_dir_all(&config.manifests_dir).unwrap();
        Store::new(&config, lock::Manager::new(dir.join("locks")))
    }

    fn stage(dir: &Path, files: &[(&str, &str)]) -> PathBuf {
        let tree = dir.join("staged");
        for (path, content) in files {
            let full = tree.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        tree
    }

    const HELLO_FILES: &[(&str, &str)] = &[
        ("usr/bin/hello", "#!/bin/sh\necho hello\n"),
        ("usr/share/man/man1/hello.1", "manual page"),
    ];

    #[test]
    fn pack_produces_archive_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tree = stage(dir.path(), HELLO_FILES);

        let artifact = store.pack("hello", "1.0", &tree).unwrap();

        assert!(artifact.archive.exists());
        assert!(artifact.manifest_path.exists());
        assert!(!artifact.deduplicated);
        assert_eq!(artifact.manifest.len(), 2);

        assert!(store.cache_check("hello", "1.0").is_some());
        assert!(store.cache_check("hello", "2.0").is_none());
    }

    #[test]
    fn identical_trees_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tree = stage(dir.path(), HELLO_FILES);

        let first = store.pack("hello", "1.0", &tree).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = store.pack("hello", "1.0", &tree).unwrap();

        assert!(second.deduplicated);
        assert_eq!(first.archive, second.archive);

        // No extra archive appeared
        let archives = fs::read_dir(dir.path().join("binaries"))
            .unwrap()
            .flatten()
            .count();
        assert_eq!(archives, 1);
    }

    #[test]
    fn pack_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path());
        // Second tree would dedup against the first cache, so pack it
        // into a separate store
        let second = store(&dir.path().join("fresh"));

        let tree_a = stage(&dir.path().join("a"), HELLO_FILES);
        let tree_b = stage(&dir.path().join("b"), HELLO_FILES);

        let a = first.pack("hello", "1.0", &tree_a).unwrap();
        let b = second.pack("hello", "1.0", &tree_b).unwrap();

        assert_eq!(
            util::hash_file(&a.archive).unwrap(),
            util::hash_file(&b.archive).unwrap()
        );
        assert_eq!(a.manifest.render(), b.manifest.render());
    }

    #[test]
    fn install_verify_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tree = stage(dir.path(), HELLO_FILES);
        let root = dir.path().join("rootfs");

        let artifact = store.pack("hello", "1.0", &tree).unwrap();
        let manifest = store
            .install("hello", "1.0", &root, false, None)
            .unwrap();

        assert!(root.join("usr/bin/hello").is_file());

        // Idempotent install: verify clean after a second pass
        store.install("hello", "1.0", &root, false, None).unwrap();
        let report = store.verify(&artifact.manifest_path, &root).unwrap();
        assert!(report.clean());

        // Remove clears every manifest path and prunes empty dirs
        let removed = store.remove(&artifact.manifest_path, &root).unwrap();
        assert_eq!(removed.removed.len(), manifest.len());
        assert!(!root.join("usr/bin/hello").exists());
        assert!(!root.join("usr/share/man").exists());

        let after = store.verify(&artifact.manifest_path, &root).unwrap();
        assert_eq!(after.missing.len(), manifest.len());
    }

    #[test]
    fn modified_files_survive_remove_under_keep_policy() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let tree = stage(dir.path(), HELLO_FILES);
        let root = dir.path().join("rootfs");

        let artifact = store.pack("hello", "1.0", &tree).unwrap();
        store.install("hello", "1.0", &root, false, None).unwrap();

        // Local modification
        fs::write(root.join("usr/bin/hello"), "patched by admin").unwrap();

        let report = store.remove(&artifact.manifest_path, &root).unwrap();
        assert_eq!(report.kept_modified, vec!["./usr/bin/hello"]);
        assert!(root.join("usr/bin/hello").exists());
    }

    #[test]
    fn gc_keeps_newest_per_package() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let tree_v1 = stage(&dir.path().join("v1"), &[("usr/bin/a", "one")]);
        let tree_v2 = stage(&dir.path().join("v2"), &[("usr/bin/a", "two")]);

        store.pack("pkg", "1.0", &tree_v1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        store.pack("pkg", "2.0", &tree_v2).unwrap();

        // Zero retention, keep one: the older artifact goes
        let removed = store.gc(0, 1).unwrap();
        assert_eq!(removed, 1);
        assert!(store.cache_check("pkg", "2.0").is_some());
        assert!(store.cache_check("pkg", "1.0").is_none());
    }
}
