// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Upstream version detection and recipe updates.
//!
//! Detection prefers the recipe's `[update]` hints (api URL + regex);
//! otherwise it falls back to host heuristics: forge release feeds,
//! directory listings next to the recorded source, and the project
//! page. A strictly newer version is probed by constructing candidate
//! download URLs; the first candidate that fetches as a plausible
//! archive supplies the new checksum.

use std::cmp::Ordering;

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::{
    fetch::{self, Fetcher},
    recipe, util,
};

/// What a workflow does with a detected update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Mode {
    /// Report only
    #[default]
    Check,
    /// Rewrite the recipe only
    UpdateMeta,
    /// Rewrite, build through packaging, discard
    DryRun,
    /// Rewrite, build, install, mark
    Upgrade,
}

/// A fully probed update: new version, working URL, fresh checksum
#[derive(Debug, Clone)]
pub struct Proposal {
    pub name: String,
    pub current: String,
    pub latest: String,
    pub url: Url,
    pub sha256: String,
    /// Index of the source entry the proposal rewrites
    pub source_index: usize,
}

pub struct Checker<'a> {
    fetcher: &'a Fetcher,
    store: &'a recipe::Store,
}

impl<'a> Checker<'a> {
    pub fn new(fetcher: &'a Fetcher, store: &'a recipe::Store) -> Self {
        Self { fetcher, store }
    }

    /// Latest upstream version, if any strategy can find one
    pub fn detect(&self, loaded: &recipe::Loaded) -> Result<Option<String>, Error> {
        let recipe = &loaded.parsed;

        let mut found: Vec<String> = vec![];

        // Explicit api + regex beats every heuristic
        if let (Some(api), Some(pattern)) = (&recipe.update.api, &recipe.update.regex) {
            let regex = Regex::new(pattern).map_err(|_| Error::BadPattern(pattern.clone()))?;
            let page = self.fetcher.get_text(api)?;
            found.extend(extract_versions(&page, &regex));
        } else {
            for page_url in heuristic_pages(recipe) {
                let Ok(page) = self.fetcher.get_text(&page_url) else {
                    continue;
                };
                let regex = archive_pattern(&recipe.name);
                found.extend(extract_versions(&page, &regex));
            }
        }

        Ok(found.into_iter().max_by(|a, b| compare_versions(a, b)))
    }

    /// Detect, compare, and probe candidate URLs. `None` means the
    /// recipe is already current.
    pub fn propose(&self, loaded: &recipe::Loaded) -> Result<Option<Proposal>, Error> {
        let recipe = &loaded.parsed;
        let current = recipe
            .version
            .clone()
            .ok_or_else(|| Error::NoVersion(recipe.name.clone()))?;

        let Some(latest) = self.detect(loaded)? else {
            return Ok(None);
        };

        if compare_versions(&latest, &current) != Ordering::Greater {
            return Ok(None);
        }

        let source = recipe
            .sources
            .first()
            .ok_or_else(|| Error::NoSources(recipe.name.clone()))?;

        let candidates = candidate_urls(&source.uri, &current, &latest);
        log::info!(
            target: "upstream",
            "{}: {current} -> {latest}, probing {} candidate urls",
            recipe.name,
            candidates.len()
        );

        for candidate in candidates {
            match self.fetcher.fetch(&candidate, None, None) {
                Ok(path) => {
                    let sha256 = util::hash_file(&path)?;
                    return Ok(Some(Proposal {
                        name: recipe.name.clone(),
                        current,
                        latest,
                        url: candidate,
                        sha256,
                        source_index: source.index,
                    }));
                }
                Err(error) => {
                    log::debug!(target: "upstream", "candidate {candidate} rejected: {error}");
                }
            }
        }

        Err(Error::NoWorkingCandidate {
            name: recipe.name.clone(),
            version: latest,
        })
    }

    /// Rewrite version, URL and checksum through the store's atomic
    /// update path (which retains a timestamped backup)
    pub fn apply(&self, loaded: &recipe::Loaded, proposal: &Proposal) -> Result<(), Error> {
        let updates = vec![
            ("package.version".to_owned(), proposal.latest.clone()),
            (
                format!("sources.url_{}", proposal.source_index),
                proposal.url.to_string(),
            ),
            (
                format!("sources.sha256_{}", proposal.source_index),
                proposal.sha256.clone(),
            ),
        ];

        self.store.update_atomic(&loaded.path, &updates)?;
        Ok(())
    }
}

/// Segment compare: split on `.`/`-`/`_`, strip trailing non-digits,
/// numeric per segment, longer wins when the common prefix is equal
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a: Vec<u64> = segments(a);
    let b: Vec<u64> = segments(b);

    for (x, y) in a.iter().zip(&b) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    a.len().cmp(&b.len())
}

fn segments(version: &str) -> Vec<u64> {
    version
        .split(['.', '-', '_'])
        .map(|segment| {
            let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}

/// `name[-_]<version>.tar…` as it appears in listings and pages
fn archive_pattern(name: &str) -> Regex {
    let escaped = regex::escape(name);
    Regex::new(&format!(
        r"{escaped}[-_]v?([0-9]+(?:\.[0-9]+)+)\.(?:tar|tgz|zip|t[bx]z)"
    ))
    .expect("static archive pattern")
}

fn extract_versions(page: &str, regex: &Regex) -> Vec<String> {
    regex
        .captures_iter(page)
        .filter_map(|captures| {
            captures
                .get(1)
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_owned())
        })
        .collect()
}

/// Pages worth scraping when the recipe carries no explicit api
fn heuristic_pages(recipe: &metafile::Recipe) -> Vec<Url> {
    let mut pages = vec![];

    if let Some(homepage) = &recipe.homepage {
        if let Ok(url) = Url::parse(homepage) {
            // Forge release feeds list tagged archives
            if url.host_str() == Some("github.com") {
                if let Ok(atom) = Url::parse(&format!("{}/releases.atom", homepage.trim_end_matches('/'))) {
                    pages.push(atom);
                }
            }
            pages.push(url);
        }
    }

    // FTP-style directory listing beside the first source
    if let Some(source) = recipe.sources.first() {
        if let Ok(parent) = source.uri.join(".") {
            pages.push(parent);
        }
    }

    pages
}

/// Candidate download URLs for `new_version`: substitution in the
/// recorded URL, then common suffixes under the same directory
fn candidate_urls(old_url: &Url, old_version: &str, new_version: &str) -> Vec<Url> {
    let mut candidates = vec![];

    let substituted = old_url.as_str().replace(old_version, new_version);
    if let Ok(url) = Url::parse(&substituted) {
        if url != *old_url {
            candidates.push(url);
        }
    }

    if let Ok(dir) = old_url.join(".") {
        let name = basename_stem(old_url, old_version);
        for suffix in [".tar.gz", ".tar.xz", ".tar.bz2", ".tgz", ".zip"] {
            if let Ok(url) = dir.join(&format!("{name}-{new_version}{suffix}")) {
                if !candidates.contains(&url) {
                    candidates.push(url);
                }
            }
        }
    }

    candidates
}

/// Project name as encoded in the archive basename
/// (`hello-1.0.tar.gz` -> `hello`)
fn basename_stem(url: &Url, version: &str) -> String {
    let basename = util::uri_file_name(url);

    basename
        .split_once(&format!("-{version}"))
        .map(|(stem, _)| stem.to_owned())
        .unwrap_or_else(|| basename.split('-').next().unwrap_or(basename).to_owned())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe `{0}` has no version to compare against")]
    NoVersion(String),
    #[error("recipe `{0}` has no sources to update")]
    NoSources(String),
    #[error("invalid update regex {0:?}")]
    BadPattern(String),
    #[error("no candidate url for {name} {version} survived probing")]
    NoWorkingCandidate { name: String, version: String },
    #[error("fetch")]
    Fetch(#[from] fetch::Error),
    #[error("recipe")]
    Recipe(#[from] recipe::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Fetch(e) if e.is_transient())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{config::Config, lock};
    use fs_err as fs;

    #[test]
    fn version_comparison() {
        use Ordering::{Equal, Greater, Less};

        for (a, b, expected) in [
            ("1.0", "1.0", Equal),
            ("1.1", "1.0", Greater),
            ("1.0", "1.0.1", Less),
            ("12.3.0", "12.2.0", Greater),
            ("2.0", "10.0", Less),
            ("1.2-rc1", "1.2-rc2", Less),
            ("1.2_3", "1.2.3", Equal),
            // trailing non-digits are stripped per segment
            ("1.0a", "1.0", Equal),
        ] {
            assert_eq!(compare_versions(a, b), expected, "{a} vs {b}");
        }
    }

    #[test]
    fn candidates_substitute_and_suffix() {
        let old = Url::parse("https://ftp.gnu.org/gnu/gcc/gcc-12.2.0.tar.xz").unwrap();
        let candidates = candidate_urls(&old, "12.2.0", "12.3.0");

        assert_eq!(
            candidates[0].as_str(),
            "https://ftp.gnu.org/gnu/gcc/gcc-12.3.0.tar.xz"
        );
        assert!(candidates
            .iter()
            .any(|u| u.as_str() == "https://ftp.gnu.org/gnu/gcc/gcc-12.3.0.tar.gz"));
    }

    #[test]
    fn archive_pattern_extracts() {
        let regex = archive_pattern("hello");
        let page = r#"<a href="hello-1.0.tar.gz">old</a> <a href="hello-1.2.tar.gz">new</a>"#;

        let versions = extract_versions(page, &regex);
        assert_eq!(versions, vec!["1.0", "1.2"]);
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: recipe::Store,
        fetcher: Fetcher,
        root: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::load(Some(dir.path().to_path_buf())).unwrap();
        config.source_min_bytes = 1;

        let locks = lock::Manager::new(config.locks_dir.clone());
        let store = recipe::Store::new(config.recipe_roots.clone(), 3, locks.clone());
        let fetcher = Fetcher::new(&config, locks).unwrap();
        let root = dir.path().to_path_buf();

        Fixture {
            _dir: dir,
            store,
            fetcher,
            root,
        }
    }

    fn seed(fixture: &Fixture, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = fixture.root.join("upstream");
        fs::create_dir_all(&path).unwrap();
        let file = path.join(name);
        fs::write(&file, content).unwrap();
        file
    }

    fn write_recipe(fixture: &Fixture, name: &str, body: &str) -> std::path::PathBuf {
        // Matches the recipe root Config::load derives for this prefix
        let dir = fixture.root.join("var/lib/cairn/recipes").join(name);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.ini"));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn full_update_meta_flow() {
        let fixture = fixture();

        // Old and new upstream tarballs plus a release listing
        seed(&fixture, "hello-1.0.tar.gz", b"old upstream bytes");
        let new_tarball = seed(&fixture, "hello-1.1.tar.gz", b"new upstream bytes!");
        let listing = seed(
            &fixture,
            "releases.txt",
            b"hello-1.0.tar.gz\nhello-1.1.tar.gz\n",
        );

        let old_url = Url::from_file_path(fixture.root.join("upstream/hello-1.0.tar.gz")).unwrap();
        let api_url = Url::from_file_path(&listing).unwrap();

        let recipe_path = write_recipe(
            &fixture,
            "hello",
            &format!(
                "[package]\nname = hello\nversion = 1.0\n\n[sources]\nurl_1 = {old_url}\nsha256_1 = abc\n\n[update]\napi = {api_url}\nregex = hello-([0-9.]+)\\.tar\n"
            ),
        );

        let loaded = fixture.store.load(&recipe_path).unwrap();
        let checker = Checker::new(&fixture.fetcher, &fixture.store);

        let detected = checker.detect(&loaded).unwrap();
        assert_eq!(detected.as_deref(), Some("1.1"));

        let proposal = checker.propose(&loaded).unwrap().unwrap();
        assert_eq!(proposal.latest, "1.1");
        assert_eq!(
            proposal.sha256,
            util::hash_file(&new_tarball).unwrap()
        );

        checker.apply(&loaded, &proposal).unwrap();

        // The rewritten recipe parses back with the new values
        let updated = fixture.store.load(&recipe_path).unwrap();
        assert_eq!(updated.version(), Some("1.1"));
        assert_eq!(
            updated.parsed.sources[0].sha256.as_deref(),
            Some(proposal.sha256.as_str())
        );
        assert!(updated.parsed.sources[0].uri.as_str().contains("hello-1.1"));

        // And a backup of the original remains for `recipe restore`
        let backup_exists = fs::read_dir(recipe_path.parent().unwrap())
            .unwrap()
            .flatten()
            .any(|e| e.file_name().to_string_lossy().ends_with(".bak"));
        assert!(backup_exists);
    }

    #[test]
    fn current_version_yields_no_proposal() {
        let fixture = fixture();

        seed(&fixture, "tool-2.0.tar.gz", b"current upstream");
        let listing = seed(&fixture, "list.txt", b"tool-2.0.tar.gz\n");

        let url = Url::from_file_path(fixture.root.join("upstream/tool-2.0.tar.gz")).unwrap();
        let api = Url::from_file_path(&listing).unwrap();

        let recipe_path = write_recipe(
            &fixture,
            "tool",
            &format!(
                "[package]\nname = tool\nversion = 2.0\n\n[sources]\nurl_1 = {url}\n\n[update]\napi = {api}\nregex = tool-([0-9.]+)\\.tar\n"
            ),
        );

        let loaded = fixture.store.load(&recipe_path).unwrap();
        let checker = Checker::new(&fixture.fetcher, &fixture.store);

        assert!(checker.propose(&loaded).unwrap().is_none());
    }

    #[test]
    fn stem_parsing() {
        let url = Url::parse("https://example.com/pub/libfoo-bar-1.2.3.tar.gz").unwrap();
        assert_eq!(basename_stem(&url, "1.2.3"), "libfoo-bar");
    }
}
