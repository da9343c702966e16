#![allow(
    clippy::collapsible_else_if,
    clippy::collapsible_if,
    clippy::module_inception,
    clippy::useless_format
)]
#![deny(
    clippy::get_unwrap,
    clippy::panic,
    clippy::print_stdout,
    clippy::unwrap_used,
    clippy::used_underscore_binding,
    clippy::used_underscore_items
)]

mod actions;
mod config;
mod logger;
mod sandbox;
mod util;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::CompleteEnv;
use config::{cli, resolve_config};
use log::{Log, error};
use sandbox::Sandbox;
use util::Output;

const DEFAULT_COMMAND: &str = "/bin/sh";

pub fn main() {
    // Tab completion. This does not return if completion was requested.
    CompleteEnv::with_factory(cli::Args::command).complete();

    let logger = match logger::BuildSandboxLogger::new(log::LevelFilter::Trace)
        .init()
    {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logger: {}", e);
            std::process::exit(1);
        }
    };

    let result = run(logger);
    if let Err(e) = &result {
        // nothing was replayed yet if the config never resolved
        logger.print_deferred();
        error!("{:#}", e);
    }
    logger.flush();
    std::process::exit(if result.is_ok() { 0 } else { 1 });
}

fn run(logger: &logger::BuildSandboxLogger) -> Result<()> {
    let cli: cli::Args = cli::Args::parse();

    if let Some(log_level) = cli.log_level {
        logger.set_level(log_level);
    } else {
        logger.set_level(log::LevelFilter::Info);
    };

    let config = resolve_config(cli.clone()).context("Resolving config")?;

    // Now that we've loaded the config, we can set the log level and print
    // out any deferred messages emitted while we were loading it.
    logger.set_level(config.log_level);
    logger.print_deferred();

    if let Some(action) = cli.action {
        let mut output = Output::new(cli.json);
        match action {
            cli::Action::Config { keys } => {
                actions::config(&config, keys, &mut output)?
            }
        }
        return output.finish();
    }

    let sandboxed_command = match cli.sandboxed_command {
        Some(command) if !command.is_empty() => command,
        _ => vec![DEFAULT_COMMAND.to_string()],
    };

    let sandbox = Sandbox::from_config(&config);

    // Only the process that will run the build comes back from here
    sandbox.enter().context("Setting up the build sandbox")?;

    logger.flush();
    sandbox.exec(&sandboxed_command)
}
