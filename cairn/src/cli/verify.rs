// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use cairn::Orchestrator;
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Verify installed packages against their manifests")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Verify one installed package")]
    Pkg { name: String },
    #[command(about = "Verify every installed package")]
    All,
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    let target = match &command.subcommand {
        Subcommand::Pkg { name } => Some(name.as_str()),
        Subcommand::All => None,
    };

    let summary = orchestrator.verify(target)?;

    println!("{} packages verified clean", summary.clean);

    for (name, report) in &summary.dirty {
        for path in &report.missing {
            println!("{name}: missing {path}");
        }
        for path in &report.modified {
            println!("{name}: modified {path}");
        }
    }

    for issue in &summary.fs_issues {
        println!("fs: {issue}");
    }

    Ok(!summary.ok())
}
