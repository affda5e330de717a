// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use cairn::{fetch, util, Orchestrator};
use clap::Parser;
use url::Url;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Source cache operations")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Download a url into the sources cache")]
    Fetch {
        url: Url,
        #[arg(long)]
        sha256: Option<String>,
    },
    #[command(about = "Verify a cached or local file against a checksum")]
    Verify { file: PathBuf, sha256: String },
    #[command(about = "Safely extract an archive")]
    Extract { archive: PathBuf, dest: PathBuf },
    #[command(about = "Prune cache entries older than the retention window")]
    Clean {
        #[arg(long)]
        days: Option<u64>,
    },
    #[command(about = "List the sources cache with sizes and checksums")]
    Summary,
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    match command.subcommand {
        Subcommand::Fetch { url, sha256 } => {
            let path = orchestrator
                .fetcher
                .fetch(&url, sha256.as_deref(), None)?;
            println!("{}", path.display());
        }
        Subcommand::Verify { file, sha256 } => {
            let got = util::hash_file(&file)?;
            if got == sha256 {
                println!("{}: ok", file.display());
            } else {
                println!("{}: mismatch, got {got}", file.display());
                return Ok(true);
            }
        }
        Subcommand::Extract { archive, dest } => {
            fetch::extract(&archive, &dest)?;
        }
        Subcommand::Clean { days } => {
            let days = days.unwrap_or(orchestrator.config.source_retention_days);
            let removed = orchestrator.fetcher.clean(days)?;
            println!("removed {removed} cached sources");
        }
        Subcommand::Summary => {
            for entry in orchestrator.fetcher.summary()? {
                println!("{:>10}  {}  {}", entry.size, entry.sha256, entry.name);
            }
        }
    }

    Ok(false)
}
