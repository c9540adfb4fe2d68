/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Slave node front end.
//!
//! Runs until the Master signals the experiment is finished. Exits 0 on
//! success and 1 on any setup or handshake failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use robotstone::bench::slave::Slave;
use robotstone::config::BenchConfig;
use robotstone::rt;

#[derive(Parser)]
#[command(name = "robotslave")]
#[command(version)]
#[command(about = "Robotstone benchmark - Slave node")]
struct Cli {
    /// Benchmark configuration file (YAML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log fabric and controller internals
    #[arg(long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => BenchConfig::load_from_file(path)?,
        None => BenchConfig::default(),
    };

    rt::init_process();
    let slave = Slave::launch(config).context("launching the management task")?;
    slave.wait().context("experiment failed")
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
