// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use cairn::{upstream, util, Orchestrator};
use clap::Parser;
use serde::Deserialize;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Health checks for the managed tree")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Full sweep: manifests plus filesystem sanity")]
    Scan,
    #[command(about = "Check managed binaries are executable and intact")]
    Bins,
    #[command(about = "Filesystem sanity only")]
    Fs,
    #[command(about = "Match installed versions against an advisory file")]
    Cve {
        #[arg(long, help = "Advisory JSON produced by an external scanner")]
        db: PathBuf,
    },
}

/// External scanners hand us name -> advisories; we only consume
#[derive(Debug, Deserialize)]
struct Advisory {
    id: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    affected_versions: Vec<String>,
    /// Everything strictly below this version is affected
    #[serde(default)]
    below: Option<String>,
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    match command.subcommand {
        Subcommand::Scan => {
            let summary = orchestrator.verify(None)?;
            println!("{} packages verified clean", summary.clean);
            for (name, report) in &summary.dirty {
                println!(
                    "{name}: {} missing, {} modified",
                    report.missing.len(),
                    report.modified.len()
                );
            }
            for issue in &summary.fs_issues {
                println!("fs: {issue}");
            }
            Ok(!summary.ok())
        }
        Subcommand::Bins => {
            let mut issues = 0usize;

            for dir in ["usr/bin", "usr/sbin", "bin", "sbin"] {
                let dir = orchestrator.config.target_root.join(dir);
                if !dir.is_dir() {
                    continue;
                }

                for file in util::enumerate_files(&dir, |_| true)? {
                    use std::os::unix::fs::PermissionsExt;

                    let Ok(meta) = file.metadata() else {
                        println!("unreadable {}", file.display());
                        issues += 1;
                        continue;
                    };

                    if meta.permissions().mode() & 0o111 == 0 {
                        println!("not executable {}", file.display());
                        issues += 1;
                    }
                }
            }

            println!("{issues} issues");
            Ok(issues > 0)
        }
        Subcommand::Fs => {
            let issues = orchestrator.fs_sanity()?;
            for issue in &issues {
                println!("{issue}");
            }
            Ok(!issues.is_empty())
        }
        Subcommand::Cve { db } => {
            let text = fs_err::read_to_string(&db)?;
            let advisories: std::collections::HashMap<String, Vec<Advisory>> =
                serde_json::from_str(&text).map_err(std::io::Error::from)?;

            let mut hits = 0usize;

            for record in orchestrator.installed.list()? {
                let Some(entries) = advisories.get(&record.name) else {
                    continue;
                };

                for advisory in entries {
                    let listed = advisory
                        .affected_versions
                        .iter()
                        .any(|v| v == &record.version);
                    let below = advisory.below.as_deref().is_some_and(|ceiling| {
                        upstream::compare_versions(&record.version, ceiling)
                            == std::cmp::Ordering::Less
                    });

                    if listed || below {
                        println!(
                            "{} {}: {} ({})",
                            record.name,
                            record.version,
                            advisory.id,
                            advisory.severity.as_deref().unwrap_or("unknown"),
                        );
                        hits += 1;
                    }
                }
            }

            println!("{hits} advisories match");
            Ok(hits > 0)
        }
    }
}
