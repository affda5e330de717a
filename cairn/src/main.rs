// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::process::ExitCode;

mod cli;

fn main() -> ExitCode {
    match cli::process() {
        Ok(code) => code,
        Err(error) => {
            report_error(&error);
            ExitCode::FAILURE
        }
    }
}

fn report_error(error: &cli::Error) {
    let sources = sources(error);
    let error = sources.join(": ");
    eprintln!("error: {error}");
}

fn sources(error: &dyn std::error::Error) -> Vec<String> {
    let mut sources = vec![error.to_string()];
    let mut source = error.source();

    while let Some(error) = source.take() {
        sources.push(error.to_string());
        source = error.source();
    }

    sources
}
