// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Batch outcome snapshots under `state/`, one JSON document per
//! command run. The summary printed after a batch and the worst-case
//! exit code both derive from this record.

use std::{io, path::Path};

use fs_err as fs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Pipeline ran to Packaged
    Built,
    /// A cached artifact at the right version satisfied the request
    Cached,
    Installed,
    Failed,
    /// Not attempted because a dependency failed
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub name: String,
    pub status: Status,
    /// Stage that failed, for `status = failed`
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl PackageOutcome {
    pub fn ok(name: &str, status: Status) -> Self {
        Self {
            name: name.to_owned(),
            status,
            stage: None,
            log: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub command: String,
    pub started_at: String,
    pub finished_at: String,
    pub outcomes: Vec<PackageOutcome>,
}

impl BatchReport {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_owned(),
            started_at: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    pub fn push(&mut self, outcome: PackageOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn failed(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, Status::Failed | Status::Skipped))
    }

    /// Persist as `state/last-<command>.json`
    pub fn save(&mut self, state_dir: &Path) -> io::Result<()> {
        self.finished_at = chrono::Utc::now().to_rfc3339();

        let path = state_dir.join(format!("last-{}.json", self.command));
        let temp = state_dir.join(format!("last-{}.json.tmp", self.command));

        fs::write(&temp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&temp, &path)?;

        Ok(())
    }

    /// Human summary naming each failure, its stage and its log
    pub fn summary(&self) -> String {
        let mut out = String::new();

        let built = self
            .outcomes
            .iter()
            .filter(|o| !matches!(o.status, Status::Failed | Status::Skipped))
            .count();
        out.push_str(&format!(
            "{built}/{} packages succeeded\n",
            self.outcomes.len()
        ));

        for outcome in &self.outcomes {
            if matches!(outcome.status, Status::Failed | Status::Skipped) {
                out.push_str(&format!(
                    "  {} {}: {}{}\n",
                    outcome.status,
                    outcome.name,
                    outcome
                        .stage
                        .as_deref()
                        .map(|s| format!("stage {s}, "))
                        .unwrap_or_default(),
                    outcome.log.as_deref().unwrap_or("no log"),
                ));
            }
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();

        let mut report = BatchReport::new("build");
        report.push(PackageOutcome::ok("hello", Status::Built));
        report.push(PackageOutcome {
            name: "broken".to_owned(),
            status: Status::Failed,
            stage: Some("build".to_owned()),
            log: Some("/logs/broken-build.log".to_owned()),
            message: Some("exit 2".to_owned()),
        });

        report.save(dir.path()).unwrap();
        assert!(report.failed());

        let text = fs::read_to_string(dir.path().join("last-build.json")).unwrap();
        let reloaded: BatchReport = serde_json::from_str(&text).unwrap();
        assert_eq!(reloaded.outcomes.len(), 2);

        let summary = report.summary();
        assert!(summary.contains("1/2"));
        assert!(summary.contains("broken"));
        assert!(summary.contains("stage build"));
    }
}
