/*
SPDX-FileCopyrightText: Copyright 2026 Leitzke Lab
SPDX-License-Identifier: GPL-2.0-or-later
*/

//! Master node front end.
//!
//! Prompts for a single character on stdin: `'1'..'7'` selects an
//! experiment, anything else measures raw speed only. Exits 0 on success
//! and 1 on any setup or handshake failure.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;

use robotstone::bench::master::Master;
use robotstone::config::BenchConfig;
use robotstone::rt;

#[derive(Parser)]
#[command(name = "robotmaster")]
#[command(version)]
#[command(about = "Robotstone benchmark - Master node")]
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
    let master = Master::launch(config).context("launching the management task")?;

    println!("Insert Experiment ID + ENTER: 1 to 7");
    println!("Or press any other key to get processor raw speed.");
    master.request_experiment(read_experiment_id());

    master.wait().context("experiment failed")
}

/// Read one character from stdin; anything outside `'1'..'7'` (including
/// EOF) selects the raw-speed measurement.
fn read_experiment_id() -> u8 {
    let mut byte = [0u8; 1];
    match std::io::stdin().read(&mut byte) {
        Ok(1) if byte[0].is_ascii_digit() => byte[0] - b'0',
        _ => 0,
    }
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
