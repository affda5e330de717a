// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use cairn::{
    orchestrator::UpdateResult,
    upstream::{Checker, Mode},
    Orchestrator,
};
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Upstream version checks and upgrades")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Report newer upstream versions")]
    Check {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
    #[command(about = "Rewrite recipes to the detected version")]
    Meta { name: String },
    #[command(about = "Probe candidate urls without touching the recipe")]
    TestLink { name: String },
    #[command(about = "Rewrite, build through packaging, discard")]
    DryRun { name: String },
    #[command(about = "Rewrite, build, install and mark")]
    Upgrade {
        name: Option<String>,
        #[arg(long, conflicts_with = "name")]
        all: bool,
    },
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    let (target, mode) = match &command.subcommand {
        Subcommand::Check { name, .. } => (name.clone(), Mode::Check),
        Subcommand::Meta { name } => (Some(name.clone()), Mode::UpdateMeta),
        Subcommand::DryRun { name } => (Some(name.clone()), Mode::DryRun),
        Subcommand::Upgrade { name, .. } => (name.clone(), Mode::Upgrade),
        Subcommand::TestLink { name } => {
            return test_link(orchestrator, name);
        }
    };

    let outcomes = orchestrator.update(target.as_deref(), mode)?;
    let mut failed = false;

    for outcome in outcomes {
        match outcome.result {
            UpdateResult::Current => println!("{}: up to date", outcome.name),
            UpdateResult::Newer { current, latest } => {
                println!("{}: {current} -> {latest}", outcome.name);
            }
            UpdateResult::Error(message) => {
                println!("{}: {message}", outcome.name);
                failed = true;
            }
        }
    }

    Ok(failed)
}

/// Probe only: show the working candidate url and its checksum
fn test_link(orchestrator: &Orchestrator, name: &str) -> Result<bool, Error> {
    let loaded = orchestrator.store.load_by_name(name)?;
    let checker = Checker::new(&orchestrator.fetcher, &orchestrator.store);

    match checker.propose(&loaded)? {
        Some(proposal) => {
            println!("{}: {} ({})", proposal.latest, proposal.url, proposal.sha256);
            Ok(false)
        }
        None => {
            println!("{name}: up to date");
            Ok(false)
        }
    }
}
