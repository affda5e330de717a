// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use cairn::Orchestrator;
use clap::Parser;

use super::Error;

#[derive(Debug, Parser)]
#[command(about = "Create, inspect and edit recipes")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Materialize a starter recipe")]
    Create {
        category: String,
        name: String,
        #[arg(long)]
        sub: Option<String>,
    },
    #[command(about = "List recipe files across the configured roots")]
    List {
        #[arg(long)]
        root: Option<PathBuf>,
    },
    #[command(about = "Parse a recipe and print its logical content")]
    Load { name: String },
    #[command(about = "Read a single field by dotted name")]
    Get { name: String, field: String },
    #[command(about = "Write a single field atomically")]
    Set {
        name: String,
        field: String,
        value: String,
    },
    #[command(about = "Validate structure, report warnings")]
    Validate { name: String },
    #[command(about = "Diff a recipe against its newest backup")]
    Diff { name: String },
    #[command(about = "Restore a recipe from its newest backup")]
    Restore { name: String },
    #[command(about = "Prune old recipe backups")]
    BackupClean {
        name: String,
        #[arg(long, default_value_t = 1)]
        keep: usize,
    },
}

/// Arguments name either a recipe or an explicit path to one
fn resolve(orchestrator: &Orchestrator, name: &str) -> Result<PathBuf, Error> {
    let as_path = PathBuf::from(name);
    if as_path.is_file() {
        return Ok(as_path);
    }

    Ok(orchestrator.store.find(name)?)
}

pub fn handle(command: Command, orchestrator: &Orchestrator) -> Result<bool, Error> {
    let store = &orchestrator.store;

    match command.subcommand {
        Subcommand::Create { category, name, sub } => {
            let path = store.create(&category, &name, sub.as_deref())?;
            println!("created {}", path.display());
        }
        Subcommand::List { root } => {
            for path in store.list(root.as_deref())? {
                println!("{}", path.display());
            }
        }
        Subcommand::Load { name } => {
            let path = resolve(orchestrator, &name)?;
            let loaded = store.load(&path)?;
            let recipe = &loaded.parsed;

            println!("name: {}", recipe.name);
            println!("version: {}", recipe.version.as_deref().unwrap_or("-"));
            if let Some(description) = &recipe.description {
                println!("description: {description}");
            }
            for source in &recipe.sources {
                println!(
                    "source {}: {} {}",
                    source.index,
                    source.uri,
                    source.sha256.as_deref().unwrap_or("(no checksum)")
                );
            }
            if !recipe.depends.is_empty() {
                println!("depends: {}", recipe.depends.join(", "));
            }
            if !recipe.build_deps.is_empty() {
                println!("build deps: {}", recipe.build_deps.join(", "));
            }
            println!("build system: {}", recipe.build.system);
        }
        Subcommand::Get { name, field } => {
            let path = resolve(orchestrator, &name)?;
            println!("{}", store.get(&path, &field)?);
        }
        Subcommand::Set { name, field, value } => {
            let path = resolve(orchestrator, &name)?;
            store.set(&path, &field, &value)?;
        }
        Subcommand::Validate { name } => {
            let path = resolve(orchestrator, &name)?;
            let loaded = store.load(&path)?;

            let issues = store.validate(&loaded)?;
            if issues.is_empty() {
                println!("{}: ok", loaded.name());
            }
            for issue in &issues {
                println!("{}: warning: {issue}", loaded.name());
            }
        }
        Subcommand::Diff { name } => {
            let path = resolve(orchestrator, &name)?;
            print!("{}", store.diff(&path)?);
        }
        Subcommand::Restore { name } => {
            let path = resolve(orchestrator, &name)?;
            let backup = store.restore(&path)?;
            println!("restored {} from {}", path.display(), backup.display());
        }
        Subcommand::BackupClean { name, keep } => {
            let path = resolve(orchestrator, &name)?;
            let removed = store.backup_clean(&path, keep)?;
            println!("removed {removed} backups");
        }
    }

    Ok(false)
}
