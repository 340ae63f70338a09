// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Messages shown to the user and the per-user policy files.
//!
//! Layout under `user_dir`:
//!
//! ```text
//! <user_dir>/<user>/banned   presence denies the user; contents are shown
//! <user_dir>/<user>/motd     personal greeting, overrides motd_file
//! ```

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use colored::Colorize;
use tracing::{error, info};

use crate::config::AuthiptConfig;
use crate::identity::SessionIdentity;

/// Result of looking for a user's ban marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BanStatus {
    Allowed,
    /// The marker exists; its contents are the message for the user.
    Banned(PathBuf),
    /// The marker could not be checked. Treated as a denial.
    Unverifiable(PathBuf),
}

impl BanStatus {
    pub fn is_denied(&self) -> bool {
        !matches!(self, BanStatus::Allowed)
    }
}

/// Look for `<user_dir>/<user>/banned`.
pub fn check_banned(config: &AuthiptConfig, username: &str) -> BanStatus {
    let path = config.user_home(username).join("banned");
    match File::open(&path) {
        Ok(_) => {
            info!(user = username, "USER_BANNED | ban file exists");
            BanStatus::Banned(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => BanStatus::Allowed,
        Err(e) => {
            error!(user = username, error = %e, "could not open ban file");
            BanStatus::Unverifiable(path)
        }
    }
}

/// The personal motd if it is a regular file, otherwise the global one.
pub fn motd_path(config: &AuthiptConfig, username: &str) -> PathBuf {
    let personal = config.user_home(username).join("motd");
    if personal.is_file() {
        personal
    } else {
        config.motd_file.clone()
    }
}

/// Copy a message file to `out` byte for byte, whatever its encoding. A
/// file that cannot be opened prints nothing.
pub fn print_message(out: &mut dyn Write, path: &Path) -> io::Result<()> {
    let Ok(mut file) = File::open(path) else {
        return Ok(());
    };
    io::copy(&mut file, out)?;
    out.flush()
}

pub fn write_greeting(
    out: &mut dyn Write,
    config: &AuthiptConfig,
    identity: &SessionIdentity,
) -> io::Result<()> {
    let line = format!(
        "Hello {} - you are authenticated from host {}.",
        identity.username(),
        identity.source_address()
    );
    writeln!(out, "{}", line.bold())?;
    print_message(out, &motd_path(config, identity.username()))
}

pub fn write_banned_notice(out: &mut dyn Write, status: &BanStatus) -> io::Result<()> {
    writeln!(out, "{}", "Your account is banned from authentication.".red())?;
    if let BanStatus::Banned(path) = status {
        print_message(out, path)?;
    }
    out.flush()
}

pub fn write_unavailable_notice(
    out: &mut dyn Write,
    config: &AuthiptConfig,
    pid: u32,
) -> io::Result<()> {
    writeln!(
        out,
        "\n\n{}",
        "Authentication is unavailable due to technical difficulties.".yellow()
    )?;
    print_message(out, &config.problem_file)?;
    writeln!(out, "Your authentication process (pid {}) was unable to run", pid)?;
    out.flush()
}

pub fn write_admission_failed(out: &mut dyn Write) -> io::Result<()> {
    writeln!(out, "Unable to modify filters")?;
    out.flush()
}
