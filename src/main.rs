// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! authipt login shell.
//!
//! sshd runs this as the user's shell. It never spawns an interactive
//! shell; it admits the client address, waits for the session to end and
//! revokes the admission.

use std::fs::OpenOptions;
use std::io;
use std::process;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};

use authipt::{identity, signals, AuthiptConfig, Gatekeeper, IdentityError, PRECONDITION_EXIT_CODE};

#[derive(Parser)]
#[command(name = "authipt", version, about = "Authenticating gateway shell")]
struct Cli {
    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Command requested by sshd for a non-interactive session (refused)
    #[arg(short = 'c', hide = true)]
    command: Option<String>,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            0
        }
    };
    process::exit(code);
}

fn run() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if !e.use_stderr() => e.exit(),
        Err(e) => {
            init_logging(None, Level::WARN);
            error!(kind = ?e.kind(), "unusable arguments");
            return Ok(0);
        }
    };

    let config = match AuthiptConfig::load().context("Failed to load configuration") {
        Ok(config) => config,
        Err(e) => {
            init_logging(None, Level::WARN);
            return Err(e);
        }
    };
    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    init_logging(config.log_file.as_deref(), level);

    if cli.print_config {
        let json = serde_json::to_string_pretty(&config).context("Failed to serialize configuration")?;
        println!("{}", json);
        return Ok(0);
    }

    let precondition_code = if config.strict_exit_codes {
        PRECONDITION_EXIT_CODE
    } else {
        0
    };

    if let Some(command) = cli.command {
        error!("{}", IdentityError::CommandRequested(command));
        return Ok(precondition_code);
    }

    let identity = match identity::resolve_current(&config) {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "PRECONDITION_FAILED");
            return Ok(precondition_code);
        }
    };

    let flag = signals::install();
    info!(session = %identity, pid = process::id(), "SESSION_START");

    let strict = config.strict_exit_codes;
    let mut gatekeeper = Gatekeeper::new(config, identity, flag);
    let outcome = gatekeeper.run();
    info!(outcome = ?outcome, "SESSION_END");
    Ok(outcome.exit_code(strict))
}

/// Log to `log_file` if it can be opened for append, else to stderr.
/// Never to stdout: that is the user's terminal.
fn init_logging(log_file: Option<&std::path::Path>, level: Level) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false);

    let file = log_file.and_then(|path| {
        OpenOptions::new().create(true).append(true).open(path).ok()
    });
    let _ = match file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
}
