// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Typed view over a parsed [`Document`], modelling a single package
//! recipe: identity, sources, patches, hooks, dependencies and build
//! directives.

use std::collections::BTreeMap;

use thiserror::Error;
use url::Url;

use crate::{Document, Entry};

/// Schemes a source reference may use
const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "file", "git"];

/// A fetchable source with its stable index, used to correlate
/// the `url_<k>` / `sha256_<k>` pairs of the `[sources]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub index: usize,
    pub uri: Url,
    pub sha256: Option<String>,
}

/// Hook points surrounding the build stages
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum HookStage {
    PrePrepare,
    PostPrepare,
    PreConfigure,
    PostConfigure,
    PreBuild,
    PostBuild,
    PreCheck,
    PostCheck,
    PreInstall,
    PostInstall,
    PreUninstall,
    PostUninstall,
}

/// Known build systems, used for `auto` detection and defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum BuildSystem {
    #[default]
    Auto,
    Autotools,
    Cmake,
    Meson,
    Make,
    Cargo,
    Node,
    Python,
    Custom,
}

/// `[build]` directives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Build {
    pub system: BuildSystem,
    pub configure: Option<String>,
    pub build: Option<String>,
    pub check: Option<String>,
    pub install: Option<String>,
    pub prefix: Option<String>,
    pub jobs: Option<usize>,
    pub strict_check: bool,
}

impl Build {
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or("/usr")
    }
}

/// `[update]` hints consumed by the upstream version checker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    pub api: Option<Url>,
    pub regex: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Recipe {
    pub name: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub category: Option<String>,
    pub arch: Vec<String>,
    pub x11: bool,
    pub desktop: bool,
    pub sources: Vec<Source>,
    /// Directory of pre-fetched sources, honored in place of `url_*` keys
    pub sources_dir: Option<String>,
    pub patches: Vec<String>,
    pub hooks: BTreeMap<HookStage, String>,
    /// Hook failures at `post_*` stages become fatal
    pub strict_hooks: bool,
    pub depends: Vec<String>,
    pub build_deps: Vec<String>,
    pub opt_deps: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub build: Build,
    pub update: Update,
}

impl Recipe {
    /// Build the typed view from a parsed document
    pub fn from_document(doc: &Document) -> Result<Self, Error> {
        // `name` may live at top level or under `[package]`
        let name = doc
            .get("package.name")
            .or_else(|| doc.get("name"))
            .ok_or(Error::MissingName)?
            .to_owned();

        validate_name(&name)?;

        let field = |key: &str| doc.get(key).map(str::to_owned);

        let mut recipe = Recipe {
            name,
            version: field("package.version").or_else(|| field("version")),
            description: field("package.description"),
            homepage: field("package.homepage"),
            category: field("package.category"),
            arch: name_list(doc.get("package.arch").unwrap_or_default()),
            x11: bool_value(doc.get("package.x11")),
            desktop: bool_value(doc.get("package.desktop")),
            sources_dir: field("sources.dir"),
            depends: name_list(doc.get("deps.depends").unwrap_or_default()),
            build_deps: name_list(doc.get("deps.build_deps").unwrap_or_default()),
            opt_deps: name_list(doc.get("deps.opt_deps").unwrap_or_default()),
            ..Default::default()
        };

        recipe.sources = sources(doc)?;
        recipe.patches = doc.section("patches").map(|e| e.value.clone()).collect();
        (recipe.hooks, recipe.strict_hooks) = hooks(doc)?;
        recipe.environment = doc
            .section("environment")
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        recipe.build = build(doc)?;
        recipe.update = update(doc)?;

        Ok(recipe)
    }
}

/// `name` is restricted so it can double as a file and lock name
fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_owned()))
    }
}

fn sources(doc: &Document) -> Result<Vec<Source>, Error> {
    let mut sha_by_index = BTreeMap::new();
    let mut urls = vec![];

    for entry in doc.section("sources") {
        if let Some(suffix) = entry.key.strip_prefix("sha256_") {
            let index = source_index(suffix, entry)?;
            sha_by_index.insert(index, entry.value.clone());
        } else if let Some(suffix) = entry.key.strip_prefix("url_") {
            let index = source_index(suffix, entry)?;
            urls.push((index, entry));
        } else if entry.key != "dir" {
            return Err(Error::UnknownSourceKey {
                key: entry.key.clone(),
                line: entry.line,
            });
        }
    }

    urls.into_iter()
        .map(|(index, entry)| {
            let uri = Url::parse(&entry.value).map_err(|error| Error::InvalidUrl {
                key: entry.name(),
                error,
            })?;

            if !SUPPORTED_SCHEMES.contains(&uri.scheme()) {
                return Err(Error::UnsupportedScheme {
                    key: entry.name(),
                    scheme: uri.scheme().to_owned(),
                });
            }

            Ok(Source {
                index,
                uri,
                sha256: sha_by_index.get(&index).cloned(),
            })
        })
        .collect()
}

fn source_index(suffix: &str, entry: &Entry) -> Result<usize, Error> {
    suffix.parse().map_err(|_| Error::UnknownSourceKey {
        key: entry.key.clone(),
        line: entry.line,
    })
}

fn hooks(doc: &Document) -> Result<(BTreeMap<HookStage, String>, bool), Error> {
    let mut hooks = BTreeMap::new();
    let mut strict = false;

    for entry in doc.section("hooks") {
        if entry.key == "strict" {
            strict = bool_value(Some(&entry.value));
            continue;
        }

        let stage = entry
            .key
            .parse::<HookStage>()
            .map_err(|_| Error::UnknownHookStage {
                key: entry.key.clone(),
                line: entry.line,
            })?;

        hooks.insert(stage, entry.value.clone());
    }

    Ok((hooks, strict))
}

fn build(doc: &Document) -> Result<Build, Error> {
    let system = match doc.get("build.system") {
        Some(value) => value
            .parse::<BuildSystem>()
            .map_err(|_| Error::UnknownBuildSystem(value.to_owned()))?,
        None => BuildSystem::default(),
    };

    let jobs = doc
        .get("build.jobs")
        .map(|value| {
            value
                .parse::<usize>()
                .map_err(|_| Error::InvalidJobs(value.to_owned()))
        })
        .transpose()?;

    Ok(Build {
        system,
        configure: doc.get("build.configure").map(str::to_owned),
        build: doc.get("build.build").map(str::to_owned),
        check: doc.get("build.check").map(str::to_owned),
        install: doc.get("build.install").map(str::to_owned),
        prefix: doc.get("build.prefix").map(str::to_owned),
        jobs,
        strict_check: bool_value(doc.get("build.strict_check")),
    })
}

fn update(doc: &Document) -> Result<Update, Error> {
    let api = doc
        .get("update.api")
        .map(|value| {
            Url::parse(value).map_err(|error| Error::InvalidUrl {
                key: "update.api".to_owned(),
                error,
            })
        })
        .transpose()?;

    Ok(Update {
        api,
        regex: doc.get("update.regex").map(str::to_owned),
    })
}

/// Comma separated name lists, as used by `[deps]` and `arch`
pub fn name_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn bool_value(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_lowercase).as_deref(),
        Some("true" | "yes" | "1" | "on")
    )
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("recipe is missing required field `name`")]
    MissingName,
    #[error("invalid package name {0:?}")]
    InvalidName(String),
    #[error("line {line}: unrecognized key `{key}` in [sources]")]
    UnknownSourceKey { key: String, line: usize },
    #[error("invalid url for `{key}`")]
    InvalidUrl {
        key: String,
        #[source]
        error: url::ParseError,
    },
    #[error("unsupported scheme `{scheme}` for `{key}`")]
    UnsupportedScheme { key: String, scheme: String },
    #[error("line {line}: `{key}` is not a recognized hook stage")]
    UnknownHookStage { key: String, line: usize },
    #[error("unknown build system {0:?}")]
    UnknownBuildSystem(String),
    #[error("invalid job count {0:?}")]
    InvalidJobs(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse;

    const HELLO: &str = r#"
[package]
name = hello
version = 1.0
description = Friendly greeter

[sources]
url_1 = https://example.com/hello-1.0.tar.gz
sha256_1 = 2d2d68a8b5b4ebe280b2dcbb63e0ff39b0b0b4f9b7e5a0c5f4e3a1b2c3d4e5f6

[patches]
p1 = fix-musl.patch

[hooks]
pre_build = hooks/pre_build.sh

[deps]
depends = glibc, libfoo
build_deps = make

[build]
system = autotools
jobs = 4

[environment]
CFLAGS = -O2
"#;

    #[test]
    fn typed_view() {
        let doc = parse(HELLO).unwrap();
        let recipe = Recipe::from_document(&doc).unwrap();

        assert_eq!(recipe.name, "hello");
        assert_eq!(recipe.version.as_deref(), Some("1.0"));
        assert_eq!(recipe.sources.len(), 1);
        assert_eq!(recipe.sources[0].index, 1);
        assert!(recipe.sources[0].sha256.is_some());
        assert_eq!(recipe.patches, vec!["fix-musl.patch"]);
        assert_eq!(
            recipe.hooks.get(&HookStage::PreBuild).map(String::as_str),
            Some("hooks/pre_build.sh")
        );
        assert_eq!(recipe.depends, vec!["glibc", "libfoo"]);
        assert_eq!(recipe.build_deps, vec!["make"]);
        assert_eq!(recipe.build.system, BuildSystem::Autotools);
        assert_eq!(recipe.build.jobs, Some(4));
        assert_eq!(recipe.build.prefix(), "/usr");
        assert_eq!(
            recipe.environment,
            vec![("CFLAGS".to_owned(), "-O2".to_owned())]
        );
    }

    #[test]
    fn missing_name_is_fatal() {
        let doc = parse("[package]\nversion = 1.0\n").unwrap();
        assert!(matches!(
            Recipe::from_document(&doc),
            Err(Error::MissingName)
        ));
    }

    #[test]
    fn bad_scheme_rejected() {
        let doc = parse("name = x\n[sources]\nurl_1 = gopher://example.com/x\n").unwrap();
        assert!(matches!(
            Recipe::from_document(&doc),
            Err(Error::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn unknown_hook_stage_rejected() {
        let doc = parse("name = x\n[hooks]\nmid_build = nope.sh\n").unwrap();
        assert!(matches!(
            Recipe::from_document(&doc),
            Err(Error::UnknownHookStage { .. })
        ));
    }

    #[test]
    fn source_indices_correlate_checksums() {
        let doc = parse(
            "name = x\n[sources]\nurl_2 = https://example.com/b\nsha256_2 = beef\nurl_1 = https://example.com/a\n",
        )
        .unwrap();
        let recipe = Recipe::from_document(&doc).unwrap();

        // Source order preserved, checksums matched by index
        assert_eq!(recipe.sources[0].index, 2);
        assert_eq!(recipe.sources[0].sha256.as_deref(), Some("beef"));
        assert_eq!(recipe.sources[1].index, 1);
        assert_eq!(recipe.sources[1].sha256, None);
    }
}
