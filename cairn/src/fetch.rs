// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Cached, checksum-verified source fetching.
//!
//! Downloads land in the shared sources cache keyed by URL basename
//! (URL-hash prefixed when basenames collide). A populated cache with a
//! matching checksum never touches the network; a corrupted entry is
//! deleted and refetched. Failures retry with exponential backoff, then
//! walk the configured mirror prefixes.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use fs_err as fs;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::{config::Config, lock, util};

pub use self::extract::extract;

pub mod extract;

pub struct Fetcher {
    cache_dir: PathBuf,
    mirrors: Vec<Url>,
    attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
    min_bytes: u64,
    locks: lock::Manager,
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl Fetcher {
    pub fn new(config: &Config, locks: lock::Manager) -> Result<Self, Error> {
        let client = reqwest::ClientBuilder::new()
            .user_agent(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            ))
            .connect_timeout(config.connect_timeout)
            .timeout(config.fetch_timeout)
            .build()
            .map_err(Error::Client)?;

        // Workers fetch concurrently; a small multi-thread runtime
        // lets their block_on calls overlap
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        Ok(Self {
            cache_dir: config.sources_dir.clone(),
            mirrors: config.mirrors.clone(),
            attempts: config.fetch_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            min_bytes: config.source_min_bytes,
            locks,
            client,
            runtime,
        })
    }

    /// Fetch `uri` into the cache (or `dest`), verifying against
    /// `expected_sha` when one is declared. Returns the local path.
    pub fn fetch(
        &self,
        uri: &Url,
        expected_sha: Option<&str>,
        dest: Option<&Path>,
    ) -> Result<PathBuf, Error> {
        let basename = util::uri_file_name(uri);
        if basename.is_empty() {
            return Err(Error::NoFileName(uri.clone()));
        }

        let cancel = std::sync::atomic::AtomicBool::new(false);
        let _guard = self.locks.acquire(
            lock::name::source(basename),
            Duration::from_secs(3600),
            &cancel,
        )?;

        let path = match dest {
            Some(dest) => dest.to_path_buf(),
            None => self.cached_path(uri, basename),
        };

        if let Some(parent) = path.parent() {
            util::ensure_dir_exists(parent)?;
        }

        // Cache hit: trust a matching (or undeclared) checksum
        if path.exists() {
            match expected_sha {
                None => return Ok(path),
                Some(expected) => {
                    let got = util::hash_file(&path)?;
                    if got == expected {
                        return Ok(path);
                    }
                    log::warn!(
                        "cached {basename} fails verification (expected {expected}, got {got}), refetching"
                    );
                    fs::remove_file(&path)?;
                }
            }
        }

        match uri.scheme() {
            "file" => self.fetch_local(uri, &path, expected_sha)?,
            "http" | "https" => self.fetch_remote(uri, basename, &path, expected_sha)?,
            "ftp" => self.fetch_ftp(uri, &path, expected_sha)?,
            "git" => self.fetch_git(uri, &path)?,
            scheme => return Err(Error::UnsupportedScheme(scheme.to_owned())),
        }

        // Remember the origin so future basename collisions re-key
        let _ = fs::write(origin_path(&path), uri.as_str());

        Ok(path)
    }

    /// Cache location for `uri`: plain basename, re-keyed with a
    /// URL-hash prefix when another origin already claimed that name
    fn cached_path(&self, uri: &Url, basename: &str) -> PathBuf {
        let plain = self.cache_dir.join(basename);

        match fs::read_to_string(origin_path(&plain)) {
            Ok(origin) if origin != uri.as_str() => {
                let prefix = &util::hash_bytes(uri.as_str().as_bytes())[..8];
                self.cache_dir.join(format!("{prefix}-{basename}"))
            }
            _ => plain,
        }
    }

    fn fetch_local(&self, uri: &Url, path: &Path, expected: Option<&str>) -> Result<(), Error> {
        let source = uri
            .to_file_path()
            .map_err(|_| Error::NoFileName(uri.clone()))?;

        fs::copy(&source, path)?;

        if let Err(e) = self.verify(uri, path, expected) {
            let _ = fs::remove_file(path);
            return Err(e);
        }

        Ok(())
    }

    /// Git sources are cached as working clones; a `#fragment` pins
    /// the ref to check out
    fn fetch_git(&self, uri: &Url, path: &Path) -> Result<(), Error> {
        let mut bare = uri.clone();
        bare.set_fragment(None);

        let run = |args: &[&str], cwd: Option<&Path>| -> Result<(), Error> {
            let mut command = std::process::Command::new("git");
            if let Some(dir) = cwd {
                command.current_dir(dir);
            }
            let status = command.args(args).status().map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NoTool("git".to_owned()),
                _ => Error::Io(e),
            })?;

            if status.success() {
                Ok(())
            } else {
                Err(Error::Network {
                    url: uri.clone(),
                    error: None,
                })
            }
        };

        if path.exists() {
            run(&["fetch", "--tags"], Some(path))?;
        } else {
            run(
                &["clone", "--", bare.as_str(), &path.display().to_string()],
                None,
            )?;
        }

        if let Some(reference) = uri.fragment() {
            run(&["checkout", "--force", reference], Some(path))?;
        }

        Ok(())
    }

    fn fetch_remote(
        &self,
        uri: &Url,
        basename: &str,
        path: &Path,
        expected: Option<&str>,
    ) -> Result<(), Error> {
        let mut candidates = vec![uri.clone()];
        for mirror in &self.mirrors {
            if let Ok(joined) = mirror.join(basename) {
                candidates.push(joined);
            }
        }

        let mut last = None;

        for candidate in &candidates {
            let mut backoff = self.backoff_base;

            for attempt in 1..=self.attempts {
                match self.download(candidate, path) {
                    Ok(got) => match self.check(candidate, path, expected, &got) {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            // Bad content from this host, move on to
                            // the next mirror
                            let _ = fs::remove_file(path);
                            last = Some(e);
                            break;
                        }
                    },
                    Err(e) => {
                        log::warn!(
                            "download attempt {attempt}/{} for {candidate} failed: {e}",
                            self.attempts
                        );
                        last = Some(e);

                        if attempt < self.attempts {
                            std::thread::sleep(backoff);
                            backoff = (backoff * 2).min(self.backoff_cap);
                        }
                    }
                }
            }
        }

        Err(last.unwrap_or_else(|| Error::NoFileName(uri.clone())))
    }

    /// FTP rides on the system curl; transports beyond HTTP are
    /// external collaborators
    fn fetch_ftp(&self, uri: &Url, path: &Path, expected: Option<&str>) -> Result<(), Error> {
        let partial = partial_path(path);

        let status = std::process::Command::new("curl")
            .args(["--fail", "--silent", "--show-error", "--output"])
            .arg(&partial)
            .arg(uri.as_str())
            .status()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::NoTool("curl".to_owned()),
                _ => Error::Io(e),
            })?;

        if !status.success() {
            let _ = fs::remove_file(&partial);
            return Err(Error::Network {
                url: uri.clone(),
                error: None,
            });
        }

        let got = util::hash_file(&partial)?;
        fs::rename(&partial, path)?;
        self.check(uri, path, expected, &got)?;

        Ok(())
    }

    /// Streamed download with inline hashing; the hash of the written
    /// bytes is returned for verification
    fn download(&self, url: &Url, path: &Path) -> Result<String, Error> {
        let partial = partial_path(path);

        let result = self.runtime.block_on(async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| Error::Network {
                    url: url.clone(),
                    error: Some(e),
                })?;

            let mut stream = response.bytes_stream();
            let mut hasher = Sha256::new();
            let mut out = tokio::fs::File::create(&partial).await?;

            while let Some(chunk) = stream.next().await {
                let bytes = chunk.map_err(|e| Error::Network {
                    url: url.clone(),
                    error: Some(e),
                })?;
                hasher.update(&bytes);
                out.write_all(&bytes).await?;
            }

            out.flush().await?;

            Ok(hex::encode(hasher.finalize()))
        });

        match result {
            Ok(hash) => {
                fs::rename(&partial, path)?;
                Ok(hash)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e)
            }
        }
    }

    /// Size floor and checksum enforcement for a freshly landed file
    fn check(
        &self,
        url: &Url,
        path: &Path,
        expected: Option<&str>,
        got: &str,
    ) -> Result<(), Error> {
        let size = fs::metadata(path)?.len();
        if size < self.min_bytes {
            return Err(Error::TooSmall {
                url: url.clone(),
                size,
                floor: self.min_bytes,
            });
        }

        if let Some(expected) = expected {
            if got != expected {
                return Err(Error::ChecksumFailed {
                    url: url.clone(),
                    expected: expected.to_owned(),
                    got: got.to_owned(),
                });
            }
        }

        Ok(())
    }

    fn verify(&self, url: &Url, path: &Path, expected: Option<&str>) -> Result<(), Error> {
        let got = util::hash_file(path)?;
        self.check(url, path, expected, &got)
    }

    /// Fetch a small text resource: release listings, project pages.
    /// `file://` reads locally, which also keeps tests offline.
    pub fn get_text(&self, url: &Url) -> Result<String, Error> {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| Error::NoFileName(url.clone()))?;
            return Ok(fs::read_to_string(path)?);
        }

        self.runtime.block_on(async {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| Error::Network {
                    url: url.clone(),
                    error: Some(e),
                })?;

            response.text().await.map_err(|e| Error::Network {
                url: url.clone(),
                error: Some(e),
            })
        })
    }

    /// Age-based cache pruning; returns the number of entries removed
    pub fn clean(&self, older_than_days: u64) -> Result<usize, Error> {
        let cutoff = std::time::SystemTime::now()
            .checked_sub(Duration::from_secs(older_than_days * 24 * 3600));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let mut removed = 0;

        for entry in fs::read_dir(&self.cache_dir)?.flatten() {
            let meta = entry.metadata()?;
            let stale = meta
                .modified()
                .map(|modified| modified < cutoff)
                .unwrap_or(false);

            if meta.is_file() && stale {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Cache inventory for `source summary`
    pub fn summary(&self) -> Result<Vec<CacheEntry>, Error> {
        let mut entries = vec![];

        for entry in fs::read_dir(&self.cache_dir)?.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if !entry.metadata()?.is_file() || name.ends_with(".src") || name.ends_with(".part") {
                continue;
            }

            entries.push(CacheEntry {
                size: entry.metadata()?.len(),
                sha256: util::hash_file(&path)?,
                name,
                path,
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.part"))
}

/// Sidecar recording which URL produced a cache entry
fn origin_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.src"))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetching {url}")]
    Network {
        url: Url,
        #[source]
        error: Option<reqwest::Error>,
    },
    #[error("checksum mismatch for {url}: expected {expected}, got {got}")]
    ChecksumFailed {
        url: Url,
        expected: String,
        got: String,
    },
    #[error("{url} produced {size} bytes, below the {floor} byte floor")]
    TooSmall { url: Url, size: u64, floor: u64 },
    #[error("required tool `{0}` is not installed")]
    NoTool(String),
    #[error("archive entry escapes the extraction root: {0:?}")]
    UnsafePath(PathBuf),
    #[error("no extractor for {0:?}")]
    UnsupportedArchive(PathBuf),
    #[error("archive failed to list or extract: {0:?}")]
    CorruptArchive(PathBuf),
    #[error("unsupported url scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("{0} has no usable file name")]
    NoFileName(Url),
    #[error("building http client")]
    Client(#[source] reqwest::Error),
    #[error("lock")]
    Lock(#[from] lock::Error),
    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// Network shaped failures are worth another attempt at the
    /// orchestrator level
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::Io(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn fetcher(dir: &Path) -> Fetcher {
        let mut config = Config::load(Some(dir.to_path_buf())).unwrap();
        config.sources_dir = dir.join("cache");
        fs::create_dir_all(&config.sources_dir).unwrap();
        config.source_min_bytes = 4;
        Fetcher::new(&config, lock::Manager::new(dir.join("locks"))).unwrap()
    }

    fn local_source(dir: &Path, name: &str, content: &[u8]) -> Url {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        Url::from_file_path(&path).unwrap()
    }

    #[test]
    fn file_scheme_fetch_verifies_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());

        let content = b"hello tarball bytes";
        let expected = util::hash_bytes(content);
        let uri = local_source(dir.path(), "hello-1.0.tar.gz", content);

        let path = fetcher.fetch(&uri, Some(&expected), None).unwrap();
        assert_eq!(fs::read(&path).unwrap(), content);

        // Second fetch serves the cache: deleting the origin file
        // proves no copy happens again
        fs::remove_file(dir.path().join("hello-1.0.tar.gz")).unwrap();
        let again = fetcher.fetch(&uri, Some(&expected), None).unwrap();
        assert_eq!(again, path);
    }

    #[test]
    fn corrupted_cache_entry_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());

        let content = b"pristine content here";
        let expected = util::hash_bytes(content);
        let uri = local_source(dir.path(), "pkg-2.0.tar.gz", content);

        let path = fetcher.fetch(&uri, Some(&expected), None).unwrap();

        // Truncate the cached copy; the next fetch must recover
        fs::write(&path, b"").unwrap();
        let recovered = fetcher.fetch(&uri, Some(&expected), None).unwrap();
        assert_eq!(fs::read(recovered).unwrap(), content);
    }

    #[test]
    fn checksum_mismatch_fails_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());

        let uri = local_source(dir.path(), "bad-1.0.tar.gz", b"not what you wanted");
        let wrong = util::hash_bytes(b"something else entirely");

        let err = fetcher.fetch(&uri, Some(&wrong), None).unwrap_err();
        assert!(matches!(err, Error::ChecksumFailed { .. }));
    }

    #[test]
    fn size_floor_rejects_stubs() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());

        let uri = local_source(dir.path(), "stub.tar.gz", b"x");

        let err = fetcher.fetch(&uri, None, None).unwrap_err();
        assert!(matches!(err, Error::TooSmall { .. }));
    }

    #[test]
    fn colliding_basenames_get_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(dir.path());

        let a_dir = dir.path().join("a");
        let b_dir = dir.path().join("b");
        fs::create_dir_all(&a_dir).unwrap();
        fs::create_dir_all(&b_dir).unwrap();

        let uri_a = local_source(&a_dir, "src.tar.gz", b"contents of project a");
        let uri_b = local_source(&b_dir, "src.tar.gz", b"contents of project b");

        let path_a = fetcher.fetch(&uri_a, None, None).unwrap();
        let path_b = fetcher.fetch(&uri_b, None, None).unwrap();

        assert_ne!(path_a, path_b);
        assert_eq!(fs::read(path_a).unwrap(), b"contents of project a");
        assert_eq!(fs::read(path_b).unwrap(), b"contents of project b");
    }
}
