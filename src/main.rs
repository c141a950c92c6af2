// src/main.rs
//! virtshift - CLI Entry Point

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use std::io;
use std::process::ExitCode;

mod cli;
mod commands;

use cli::Cli;

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "virtshift", &mut io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    commands::cmd_convert(cli)
}
