// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Metafile is the line-oriented recipe dialect used to describe how a
//! package is fetched, built and installed.
//!
//! The format is deliberately simple: `#` comments, optional `[section]`
//! headers which prefix subsequent keys with `section.`, `key = value`
//! entries, and multi-line block values introduced by a lone `|` and
//! terminated by a line containing a single `.`. Repeated keys keep their
//! source order, which the recipe model relies on for `url_1`, `url_2`, …

use std::str::FromStr;

use thiserror::Error;

pub use self::recipe::{Build, BuildSystem, HookStage, Recipe, Source, Update};
pub use self::updater::Updater;

pub mod recipe;
pub mod updater;

/// A single `key = value` occurrence, retaining its origin
/// for diagnostics and ordered queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Section the entry appeared under, if any
    pub section: Option<String>,
    /// Key as written, without the section prefix
    pub key: String,
    /// Unquoted, trimmed value (blocks are joined with `\n`)
    pub value: String,
    /// 1-based line number of the key
    pub line: usize,
}

impl Entry {
    /// Dotted name used for lookups, `section.key` or plain `key`
    pub fn name(&self) -> String {
        match &self.section {
            Some(section) => format!("{section}.{}", self.key),
            None => self.key.clone(),
        }
    }
}

/// An ordered, parsed metafile document
#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: Vec<Entry>,
}

impl Document {
    /// First value for the dotted `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.name() == name)
            .map(|entry| entry.value.as_str())
    }

    /// All entries under `section`, in source order
    pub fn section<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries
            .iter()
            .filter(move |entry| entry.section.as_deref() == Some(section))
    }

    /// All entries, in source order
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter()
    }

    /// Distinct section names, in order of first appearance
    pub fn sections(&self) -> Vec<&str> {
        let mut seen = vec![];
        for entry in &self.entries {
            if let Some(section) = entry.section.as_deref() {
                if !seen.contains(&section) {
                    seen.push(section);
                }
            }
        }
        seen
    }
}

impl FromStr for Document {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a metafile document from its textual form
pub fn parse(input: &str) -> Result<Document, Error> {
    let mut entries = vec![];
    let mut section: Option<String> = None;

    let mut lines = input.lines().enumerate();

    while let Some((idx, raw)) = lines.next() {
        let line_num = idx + 1;
        let line = strip_comment(raw).trim();

        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[') {
            let Some(name) = header.strip_suffix(']') else {
                return Err(Error::UnterminatedSection(line_num));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::EmptySection(line_num));
            }
            section = Some(name.to_owned());
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::MalformedEntry(line_num));
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::MalformedEntry(line_num));
        }

        let value = value.trim();

        // A lone `|` opens a block spanning until a line holding a single `.`
        let value = if value == "|" {
            let mut block = vec![];
            let mut terminated = false;

            for (_, raw) in lines.by_ref() {
                if raw.trim() == "." {
                    terminated = true;
                    break;
                }
                block.push(raw);
            }

            if !terminated {
                return Err(Error::UnterminatedBlock(line_num));
            }

            block.join("\n")
        } else {
            unquote(value).to_owned()
        };

        entries.push(Entry {
            section: section.clone(),
            key: key.to_owned(),
            value,
            line: line_num,
        });
    }

    Ok(Document { entries })
}

/// Comments run to end of line. `#` inside a value is honored as a
/// comment marker, matching the shell heritage of the format.
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn unquote(value: &str) -> &str {
    let stripped = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'));

    stripped.unwrap_or(value)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("line {0}: section header is missing its closing bracket")]
    UnterminatedSection(usize),
    #[error("line {0}: empty section name")]
    EmptySection(usize),
    #[error("line {0}: expected `key = value`")]
    MalformedEntry(usize),
    #[error("line {0}: block value is missing its `.` terminator")]
    UnterminatedBlock(usize),
    #[error("recipe: {0}")]
    Recipe(#[from] recipe::Error),
}
