// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use cairn::Orchestrator;
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Install packages onto the target root")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Install from the binary cache, building as needed")]
    PkgFromCache {
        #[arg(required = true)]
        names: Vec<String>,
    },
    #[command(about = "Pack a staged directory and install it")]
    DirToRoot {
        dir: PathBuf,
        name: String,
        version: String,
    },
}

#[derive(Debug, Parser)]
#[command(about = "Remove an installed package")]
pub struct UninstallCommand {
    pub name: String,
    #[arg(long, help = "Proceed even when other packages depend on it")]
    pub force: bool,
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    match command.subcommand {
        Subcommand::PkgFromCache { names } => {
            let report = orchestrator.install(&names)?;
            print!("{}", report.summary());
            Ok(report.failed())
        }
        Subcommand::DirToRoot { dir, name, version } => {
            let artifact = orchestrator.artifacts.pack(&name, &version, &dir)?;
            orchestrator.artifacts.install(
                &name,
                &version,
                &orchestrator.config.target_root,
                orchestrator.config.delete_extraneous,
                None,
            )?;

            orchestrator.installed.mark_installed(cairn::installed::Record {
                name: name.clone(),
                version,
                depends: vec![],
                build_deps: vec![],
                opt_deps: vec![],
                manifest: artifact
                    .manifest_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                installed_at: chrono::Utc::now().to_rfc3339(),
            })?;

            println!("installed {name} from {}", dir.display());
            Ok(false)
        }
    }
}

pub fn handle_uninstall(
    command: UninstallCommand,
    orchestrator: &Orchestrator,
) -> Result<bool, Error> {
    orchestrator.uninstall(&command.name, command.force)?;
    println!("uninstalled {}", command.name);
    Ok(false)
}
