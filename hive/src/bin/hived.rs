// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use std::process::ExitCode;
use std::sync::Arc;

use hive::services::LoggerModule;
use hive::{Config, ModuleRegistry};

#[derive(Parser)]
#[command(about = "actor runtime node")]
struct Cli {
    /// Worker thread count.
    #[arg(long, default_value_t = 8)]
    thread: usize,

    /// Cluster node ID (the high byte of every local service handle).
    #[arg(long, default_value_t = 1)]
    harbor: u8,

    /// Initial service to launch, as "module args".
    #[arg(long)]
    bootstrap: Option<String>,

    /// Module used as the log service.
    #[arg(long, default_value = "logger")]
    logservice: String,

    /// Output file for the log service (stderr when omitted).
    #[arg(long)]
    logger: Option<String>,

    /// Module search pattern; kept for configuration compatibility, modules
    /// are registered statically.
    #[arg(long)]
    cpath: Option<String>,

    /// Meter per-service CPU cost.
    #[arg(long)]
    profile: bool,

    /// Directory for per-service message logs.
    #[arg(long, default_value = ".")]
    logpath: String,
}

fn main() -> ExitCode {
    env_logger::init();

    let args = Cli::parse();

    let modules = ModuleRegistry::new();
    modules
        .register("logger", Arc::new(LoggerModule))
        .expect("registering the builtin logger cannot fail on an empty table");

    let config = Config {
        thread: args.thread,
        harbor: args.harbor,
        bootstrap: args.bootstrap,
        logservice: args.logservice,
        logger: args.logger,
        cpath: args.cpath,
        profile: args.profile,
        logpath: args.logpath,
    };

    if let Err(e) = hive::start(&config, modules) {
        eprintln!("boot failed: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
