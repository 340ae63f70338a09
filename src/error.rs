// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for authipt.
//!
//! Each class of failure the gatekeeper can hit has its own type so the
//! lifecycle can decide locally what to undo and what to tell the user:
//!
//! - [`IdentityError`] - the session environment is unusable; nothing has
//!   been locked or admitted yet.
//! - [`LockError`] - the per-address lock could not be taken; the user is
//!   never admitted.
//! - [`ExecError`] - one of the enforcement tools failed; whatever was
//!   already applied is rolled back.
//! - [`ConfigError`] - the configuration file is present but unusable.
//!
//! None of these cross the process boundary. `main` only ever sees an
//! [`crate::lifecycle::Outcome`].

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// The session environment failed validation before any lock was taken.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("non-interactive session (SSH_TTY not set)")]
    NotInteractive,

    #[error("non-interactive invocation with a command: {0}")]
    CommandRequested(String),

    #[error("could not determine connection source (SSH_CLIENT/SSH_CONNECTION not set)")]
    MissingConnection,

    #[error("connection descriptor is malformed: {0:?}")]
    MalformedConnection(String),

    #[error("could not determine IPv4 address from {0:?}")]
    InvalidAddress(String),

    #[error("could not find user for uid {0}")]
    UnknownUser(u32),

    #[error("wrong shell for user {user} (uid {uid}): {shell:?}")]
    WrongShell {
        user: String,
        uid: u32,
        shell: PathBuf,
    },

    #[error("username is empty")]
    EmptyUsername,

    #[error("username is too long ({len} > {max}): {user}")]
    UsernameTooLong { user: String, len: usize, max: usize },

    #[error("path to lock record is too long ({len} >= {max})")]
    LockPathTooLong { len: usize, max: usize },

    #[error("password database lookup failed: {0}")]
    Lookup(#[source] nix::Error),
}

/// Failure to obtain exclusive admission rights for an address.
#[derive(Debug, Error)]
pub enum LockError {
    /// Opening, locking or writing the lock record failed for a reason
    /// unrelated to contention.
    #[error("lock record I/O failed on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The current holder did not release within the retry bound, or this
    /// process was asked to terminate while waiting.
    #[error("timed out after {attempts} attempt(s) waiting for {path:?} (holder pid {holder_pid})")]
    TimedOut {
        path: PathBuf,
        attempts: u32,
        holder_pid: i32,
    },
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LockError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of one external enforcement command.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("could not run {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{program:?} exited unsuccessfully ({status})")]
    CommandFailed { program: PathBuf, status: ExitStatus },

    #[error("refusing to run {program:?} with an empty argument")]
    InvalidArgument { program: PathBuf },
}

/// The configuration file exists but cannot be used.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
