// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Apply value updates to a metafile without disturbing its layout.
//!
//! Lines that aren't touched by an operation are copied through verbatim,
//! comments and ordering included, so an updated recipe diffs cleanly
//! against its backup.

/// Apply update operations to metafile text
#[derive(Debug, Default)]
pub struct Updater {
    operations: Vec<Operation>,
}

#[derive(Debug)]
struct Operation {
    section: Option<String>,
    key: String,
    value: String,
}

impl Updater {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` under `section` (or at top level) to `value`.
    ///
    /// An existing key is rewritten in place; a missing key is appended to
    /// the end of its section, creating the section when necessary.
    pub fn set(&mut self, section: Option<&str>, key: impl ToString, value: impl ToString) {
        self.operations.push(Operation {
            section: section.map(str::to_owned),
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Set by dotted name, `section.key` or plain `key`
    pub fn set_dotted(&mut self, name: &str, value: impl ToString) {
        match name.split_once('.') {
            Some((section, key)) => self.set(Some(section), key, value),
            None => self.set(None, name, value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn apply(&self, input: &str) -> String {
        let mut output = self
            .operations
            .iter()
            .fold(input.to_owned(), |input, operation| operation.apply(&input));
        if !output.ends_with('\n') {
            output.push('\n');
        }
        output
    }
}

impl Operation {
    fn apply(&self, source: &str) -> String {
        let mut lines: Vec<String> = source.lines().map(String::from).collect();

        let mut section: Option<String> = None;
        // Index just past the last entry of the target section
        let mut insert_at = None;
        let mut idx = 0;

        while idx < lines.len() {
            let stripped = strip_comment(&lines[idx]);
            let trimmed = stripped.trim();

            if let Some(name) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                section = Some(name.trim().to_owned());
                if section.as_deref() == self.section.as_deref() {
                    insert_at = Some(idx + 1);
                }
                idx += 1;
                continue;
            }

            if let Some((key, value)) = trimmed.split_once('=') {
                // Blocks are opaque: skip their bodies so stray `=`
                // inside scripts can't be mistaken for entries
                let span = entry_span(&lines, idx, value);

                if section.as_deref() == self.section.as_deref() {
                    insert_at = Some(idx + span);

                    if key.trim() == self.key {
                        let replacement = self.render(&lines[idx]);
                        lines.splice(idx..idx + span, replacement);
                        return finish(lines, source);
                    }
                }

                idx += span;
                continue;
            }

            idx += 1;
        }

        // Key absent: append at the end of its section, or create it
        match insert_at {
            Some(at) => {
                lines.splice(at..at, self.render_fresh());
            }
            None => {
                if let Some(section) = &self.section {
                    if !lines.is_empty() && !lines.last().is_some_and(|l| l.trim().is_empty()) {
                        lines.push(String::new());
                    }
                    lines.push(format!("[{section}]"));
                }
                lines.extend(self.render_fresh());
            }
        }

        finish(lines, source)
    }

    /// Replacement lines for an existing `line`, preserving its key
    /// spelling and any trailing comment byte-for-byte
    fn render(&self, line: &str) -> Vec<String> {
        let eq = line.find('=').expect("matched line contains =");
        let prefix = &line[..eq];
        let after = &line[eq + 1..];

        // Everything past the value content survives: the whitespace
        // run and comment, exactly as written
        let content_len = strip_comment(after).trim_end().len();
        let mut trailing = &after[content_len..];
        if trailing.trim().is_empty() {
            trailing = "";
        }

        if self.value.contains('\n') {
            let mut out = vec![format!("{prefix}= |{trailing}")];
            out.extend(self.value.lines().map(String::from));
            out.push(".".to_owned());
            out
        } else {
            vec![format!("{prefix}= {}{trailing}", self.value)]
        }
    }

    fn render_fresh(&self) -> Vec<String> {
        if self.value.contains('\n') {
            let mut out = vec![format!("{} = |", self.key)];
            out.extend(self.value.lines().map(String::from));
            out.push(".".to_owned());
            out
        } else {
            vec![format!("{} = {}", self.key, self.value)]
        }
    }
}

/// Number of lines the entry at `idx` spans, including a block body
/// and its `.` terminator
fn entry_span(lines: &[String], idx: usize, value_after_eq: &str) -> usize {
    if strip_comment(value_after_eq).trim() != "|" {
        return 1;
    }

    match lines[idx + 1..].iter().position(|line| line.trim() == ".") {
        Some(body) => body + 2,
        None => lines.len() - idx,
    }
}

fn finish(mut lines: Vec<String>, source: &str) -> String {
    if source.ends_with('\n') {
        lines.push(String::new());
    }
    lines.join("\n")
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse;

    const RAW: &str = r#"[package]
name = hello
version = 1.0  # bump me

[sources]
url_1 = https://example.com/hello-1.0.tar.gz
sha256_1 = old
"#;

    #[test]
    fn replace_preserves_layout_and_comments() {
        let mut updater = Updater::new();
        updater.set(Some("package"), "version", "2.0");
        updater.set(Some("sources"), "sha256_1", "new");

        let updated = updater.apply(RAW);

        assert!(updated.contains("version = 2.0  # bump me"));
        assert!(updated.contains("sha256_1 = new"));
        // untouched lines survive byte-for-byte
        assert!(updated.contains("url_1 = https://example.com/hello-1.0.tar.gz"));
    }

    #[test]
    fn append_into_existing_section() {
        let mut updater = Updater::new();
        updater.set(Some("sources"), "url_2", "https://example.com/extra.tar.gz");

        let updated = updater.apply(RAW);
        let doc = parse(&updated).unwrap();

        assert_eq!(
            doc.get("sources.url_2"),
            Some("https://example.com/extra.tar.gz")
        );
        // appended inside [sources], not at EOF under another header
        assert_eq!(doc.section("sources").count(), 3);
    }

    #[test]
    fn create_missing_section() {
        let mut updater = Updater::new();
        updater.set_dotted("update.api", "https://example.com/releases");

        let updated = updater.apply(RAW);
        let doc = parse(&updated).unwrap();

        assert_eq!(doc.get("update.api"), Some("https://example.com/releases"));
    }

    #[test]
    fn block_values_round_trip() {
        let mut updater = Updater::new();
        updater.set(Some("build"), "configure", "./configure \\\n  --prefix=/usr");

        let updated = updater.apply(RAW);
        let doc = parse(&updated).unwrap();

        assert_eq!(
            doc.get("build.configure"),
            Some("./configure \\\n  --prefix=/usr")
        );

        // now collapse the block back to a single line
        let mut updater = Updater::new();
        updater.set(Some("build"), "configure", "cmake .");

        let collapsed = updater.apply(&updated);
        let doc = parse(&collapsed).unwrap();

        assert_eq!(doc.get("build.configure"), Some("cmake ."));
        assert!(!collapsed.contains("--prefix=/usr"));
    }

    #[test]
    fn logical_round_trip() {
        let mut updater = Updater::new();
        updater.set(Some("package"), "version", "3.1");
        updater.set(Some("package"), "category", "core");

        let updated = updater.apply(RAW);
        let doc = parse(&updated).unwrap();

        assert_eq!(doc.get("package.version"), Some("3.1"));
        assert_eq!(doc.get("package.category"), Some("core"));
        assert_eq!(doc.get("package.name"), Some("hello"));
    }
}
