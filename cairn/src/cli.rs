// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;
use std::process::ExitCode;

use cairn::{Config, LogSink, Orchestrator};
use clap::{Args, Parser};
use thiserror::Error;

mod build;
mod deps;
mod doctor;
mod install;
mod recipe;
mod source;
mod update;
mod verify;

#[derive(Debug, Parser)]
#[command(name = "cairn", about = "Source-based package build orchestrator")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, Args)]
pub struct Global {
    #[arg(
        long,
        global = true,
        help = "Target root filesystem (overrides $LFS_ROOT)"
    )]
    pub root: Option<PathBuf>,
    #[arg(
        short,
        long = "verbose",
        help = "Prints additional information about what cairn is doing",
        default_value = "false",
        global = true
    )]
    pub verbose: bool,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Recipe(recipe::Command),
    Deps(deps::Command),
    Source(source::Command),
    Build(build::Command),
    Install(install::Command),
    Uninstall(install::UninstallCommand),
    Update(update::Command),
    Verify(verify::Command),
    Doctor(doctor::Command),
}

pub fn process() -> Result<ExitCode, Error> {
    let Command { global, subcommand } = Command::parse();

    let mut config = Config::load(global.root)?;
    if global.verbose {
        config.log_level = log::LevelFilter::Debug;
    }

    let sink = LogSink::new(&config, cairn::lock::Manager::new(config.locks_dir.clone()));
    // A second `--verbose` invocation in-process would race the global
    // logger; ignore the error and keep the first sink
    let _ = sink.install();

    let orchestrator = Orchestrator::new(config)?;

    let failed = match subcommand {
        Subcommand::Recipe(command) => recipe::handle(command, &orchestrator)?,
        Subcommand::Deps(command) => deps::handle(command, &orchestrator)?,
        Subcommand::Source(command) => source::handle(command, &orchestrator)?,
        Subcommand::Build(command) => build::handle(command, &orchestrator)?,
        Subcommand::Install(command) => install::handle(command, &orchestrator)?,
        Subcommand::Uninstall(command) => install::handle_uninstall(command, &orchestrator)?,
        Subcommand::Update(command) => update::handle(command, &orchestrator)?,
        Subcommand::Verify(command) => verify::handle(command, &orchestrator)?,
        Subcommand::Doctor(command) => doctor::handle(command, &orchestrator)?,
    };

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config")]
    Config(#[from] cairn::config::Error),
    #[error("recipe")]
    Recipe(#[from] cairn::recipe::Error),
    #[error("resolve")]
    Resolve(#[from] cairn::resolver::Error),
    #[error("fetch")]
    Fetch(#[from] cairn::fetch::Error),
    #[error("build")]
    Pipeline(#[from] cairn::pipeline::Error),
    #[error("artifact")]
    Artifact(#[from] cairn::artifact::Error),
    #[error("installed db")]
    Installed(#[from] cairn::installed::Error),
    #[error("upstream")]
    Upstream(#[from] cairn::upstream::Error),
    #[error(transparent)]
    Orchestrator(#[from] cairn::orchestrator::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
