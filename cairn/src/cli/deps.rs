// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use cairn::Orchestrator;
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Dependency graph queries")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Print dependency-first build order for a target")]
    Resolve {
        target: String,
        #[arg(long)]
        strict: bool,
        #[arg(long, help = "Include optional dependencies in the edge set")]
        optional: bool,
    },
    #[command(about = "Check the whole graph for cycles and missing deps")]
    Check,
    #[command(about = "Installed packages nothing depends on")]
    Orphans,
    #[command(about = "Everything that transitively depends on a package")]
    Reverse { name: String },
    #[command(about = "Topological rebuild of every installed package")]
    RebuildAll,
    #[command(about = "Emit the graph in dot format")]
    Graph,
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    match command.subcommand {
        Subcommand::Resolve {
            target,
            strict,
            optional,
        } => {
            let graph = orchestrator.graph_with(optional)?;
            for name in graph.resolve(&target, strict)? {
                println!("{name}");
            }
        }
        Subcommand::Check => {
            let graph = orchestrator.graph()?;
            match graph.order_all(true) {
                Ok(order) => println!("ok: {} packages, no cycles", order.len()),
                Err(error) => {
                    println!("{error}");
                    return Ok(true);
                }
            }
        }
        Subcommand::Orphans => {
            let graph = orchestrator.graph()?;
            let installed: Vec<String> = orchestrator
                .installed
                .list()?
                .into_iter()
                .map(|r| r.name)
                .collect();

            for orphan in graph.orphans(&installed) {
                println!("{orphan}");
            }
        }
        Subcommand::Reverse { name } => {
            let graph = orchestrator.graph()?;
            for dependent in graph.reverse(&name) {
                println!("{dependent}");
            }
        }
        Subcommand::RebuildAll => {
            let report = orchestrator.rebuild_all()?;
            print!("{}", report.summary());
            return Ok(report.failed());
        }
        Subcommand::Graph => {
            print!("{}", orchestrator.graph()?.dot());
        }
    }

    Ok(false)
}
