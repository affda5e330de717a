// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

use cairn::{pipeline::Pipeline, Orchestrator};
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Build packages into the binary cache")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Build named packages and their dependencies")]
    Pkg {
        #[arg(required = true)]
        names: Vec<String>,
    },
    #[command(about = "Build from a directory containing a recipe")]
    FromDir { dir: PathBuf },
    #[command(about = "Build a single recipe file, dependencies ignored")]
    FromMetafile { path: PathBuf },
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    match command.subcommand {
        Subcommand::Pkg { names } => {
            let report = orchestrator.build(&names)?;
            print!("{}", report.summary());
            Ok(report.failed())
        }
        Subcommand::FromDir { dir } => {
            let recipe = find_recipe_in(&dir)?;
            build_single(orchestrator, &recipe)
        }
        Subcommand::FromMetafile { path } => build_single(orchestrator, &path),
    }
}

/// A one-off pipeline run outside graph resolution, for recipes that
/// haven't landed in a configured root yet
fn build_single(orchestrator: &Orchestrator, path: &PathBuf) -> Result<bool, Error> {
    let loaded = orchestrator.store.load(path)?;

    let pipeline = Pipeline::new(
        &loaded,
        &orchestrator.config,
        &orchestrator.fetcher,
        &orchestrator.sandbox,
        &orchestrator.sandbox,
        &orchestrator.artifacts,
    );

    let outcome = pipeline.run(&AtomicBool::new(false))?;
    println!(
        "packaged {} -> {}",
        loaded.name(),
        outcome.artifact.archive.display()
    );

    Ok(false)
}

fn find_recipe_in(dir: &PathBuf) -> Result<PathBuf, Error> {
    let mut candidates = cairn::util::enumerate_files(dir, |p| {
        p.extension().is_some_and(|e| e == "ini")
    })?;
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| cairn::recipe::Error::NotFound(dir.display().to_string()).into())
}
