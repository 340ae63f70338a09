// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Network Admission Executor.
//!
//! Admission is two independent external state changes:
//!
//! 1. the filter tool loads per-user rules for the address (`up`/`down`),
//! 2. the set tool adds the address to the membership set (`-A`/`-D`).
//!
//! They are applied in that order and undone in the reverse order. If the
//! second step fails the first is rolled back, so a failed [`Enforcer::admit`]
//! leaves nothing behind. [`Enforcer::revoke`] undoes exactly the steps the
//! given [`AdmissionState`] says were applied, attempting each one even if
//! an earlier one failed.

use std::fmt;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::unistd::{getgid, setresgid};
use tracing::{debug, error, info, warn};

use crate::config::AuthiptConfig;
use crate::error::ExecError;
use crate::identity::SessionIdentity;

/// Direction of an enforcement change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Admit,
    Revoke,
}

/// How far admission has progressed for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Unadmitted,
    FilterAdmitted,
    FullyAdmitted,
    Revoked,
}

impl AdmissionState {
    /// Whether any enforcement change may currently be applied.
    pub fn is_applied(&self) -> bool {
        matches!(self, AdmissionState::FilterAdmitted | AdmissionState::FullyAdmitted)
    }
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionState::Unadmitted => write!(f, "UNADMITTED"),
            AdmissionState::FilterAdmitted => write!(f, "FILTER_ADMITTED"),
            AdmissionState::FullyAdmitted => write!(f, "FULLY_ADMITTED"),
            AdmissionState::Revoked => write!(f, "REVOKED"),
        }
    }
}

/// Runs one external program to completion.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<(), ExecError>;
}

/// Written to the child's stderr when it could not drop to the real group id.
const GID_DROP_FAILED: &[u8] = b"authipt: could not drop to real group id\n";

/// Runs programs as child processes with the real group id.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<(), ExecError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // SAFETY: the closure runs between fork and exec and only calls
        // getgid, setresgid and write, all async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                let gid = getgid();
                if setresgid(gid, gid, gid).is_err() {
                    let _ = nix::unistd::write(io::stderr(), GID_DROP_FAILED);
                }
                Ok(())
            });
        }

        let output = command.output().map_err(|source| ExecError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        report_child_stderr(program, &output.stderr);

        if output.status.success() {
            Ok(())
        } else {
            Err(ExecError::CommandFailed {
                program: program.to_path_buf(),
                status: output.status,
            })
        }
    }
}

/// Log what a child wrote to stderr. Returns whether it reported a failed
/// group id drop, which is logged whatever the child's exit status.
fn report_child_stderr(program: &Path, stderr: &[u8]) -> bool {
    let drop_failed = stderr
        .windows(GID_DROP_FAILED.len())
        .any(|window| window == GID_DROP_FAILED);
    if drop_failed {
        warn!(program = %program.display(), "GID_DROP_FAILED | tool ran with the effective group id");
    }
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if !text.is_empty() {
        debug!(program = %program.display(), stderr = %text, "command stderr");
    }
    drop_failed
}

/// Drives the filter and membership tools for one session.
#[derive(Debug)]
pub struct Enforcer<R = SystemRunner> {
    runner: R,
    filter_tool: PathBuf,
    set_tool: PathBuf,
    set_name: String,
    set_type: String,
    user_dir: PathBuf,
    own_pid: u32,
    set_ready: bool,
}

impl Enforcer<SystemRunner> {
    pub fn from_config(config: &AuthiptConfig) -> Self {
        Self::with_runner(config, SystemRunner)
    }
}

impl<R: CommandRunner> Enforcer<R> {
    pub fn with_runner(config: &AuthiptConfig, runner: R) -> Self {
        Self {
            runner,
            filter_tool: config.filter_tool.clone(),
            set_tool: config.set_tool.clone(),
            set_name: config.set_name.clone(),
            set_type: config.set_type.clone(),
            user_dir: config.user_dir.clone(),
            own_pid: std::process::id(),
            set_ready: false,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Load or unload the per-user filter rules for the session's address.
    pub fn set_filter(&self, mode: Mode, identity: &SessionIdentity) -> Result<(), ExecError> {
        let direction = match mode {
            Mode::Admit => "up",
            Mode::Revoke => "down",
        };
        let args = vec![
            identity.username().to_string(),
            direction.to_string(),
            identity.address_key(),
            self.own_pid.to_string(),
            self.user_dir.to_string_lossy().into_owned(),
        ];
        if args.iter().any(String::is_empty) {
            error!("invalid user/address/pid for filter change");
            return Err(ExecError::InvalidArgument {
                program: self.filter_tool.clone(),
            });
        }

        match mode {
            Mode::Admit => info!(
                user = identity.username(),
                address = %identity.source_address(),
                pid = self.own_pid,
                "Adding rules"
            ),
            Mode::Revoke => info!(
                user = identity.username(),
                address = %identity.source_address(),
                pid = self.own_pid,
                "Removing rules"
            ),
        }
        self.runner.run(&self.filter_tool, &args)
    }

    /// Add the session's address to, or remove it from, the membership set.
    pub fn set_membership(&self, mode: Mode, identity: &SessionIdentity) -> Result<(), ExecError> {
        let flag = match mode {
            Mode::Admit => "-A",
            Mode::Revoke => "-D",
        };
        let args = vec![flag.to_string(), self.set_name.clone(), identity.address_key()];

        match mode {
            Mode::Admit => info!(address = %identity.source_address(), set = %self.set_name, "Adding address to set"),
            Mode::Revoke => info!(address = %identity.source_address(), set = %self.set_name, "Removing address from set"),
        }
        self.runner.run(&self.set_tool, &args)
    }

    /// Create the membership set if it does not exist yet. Runs at most
    /// once per process.
    ///
    /// The create command exits non-zero when the set already exists, so
    /// its status is only logged.
    pub fn ensure_set(&mut self) {
        if self.set_ready {
            return;
        }
        let args = vec!["-N".to_string(), self.set_name.clone(), self.set_type.clone()];
        if let Err(e) = self.runner.run(&self.set_tool, &args) {
            debug!(set = %self.set_name, error = %e, "set creation reported failure (set may already exist)");
        }
        self.set_ready = true;
    }

    /// Apply both enforcement changes.
    ///
    /// Returns [`AdmissionState::FullyAdmitted`] on success. On error the
    /// already-applied filter change has been rolled back and the session
    /// is [`AdmissionState::Unadmitted`].
    pub fn admit(&mut self, identity: &SessionIdentity) -> Result<AdmissionState, ExecError> {
        self.ensure_set();

        if let Err(e) = self.set_filter(Mode::Admit, identity) {
            error!(user = identity.username(), address = %identity.source_address(), error = %e, "ADMIT_FAILED | filter");
            return Err(e);
        }

        if let Err(e) = self.set_membership(Mode::Admit, identity) {
            error!(user = identity.username(), address = %identity.source_address(), error = %e, "ADMIT_FAILED | set membership");
            let unwound = self.revoke(identity, AdmissionState::FilterAdmitted);
            if !unwound.is_empty() {
                error!(
                    user = identity.username(),
                    address = %identity.source_address(),
                    "ROLLBACK_FAILED | filter rules may still be loaded"
                );
            }
            return Err(e);
        }

        Ok(AdmissionState::FullyAdmitted)
    }

    /// Undo whatever `state` says is applied, membership first, then filter.
    ///
    /// Every applicable step is attempted; failures are logged and returned
    /// for observability only.
    pub fn revoke(&self, identity: &SessionIdentity, state: AdmissionState) -> Vec<ExecError> {
        let mut failures = Vec::new();

        if state == AdmissionState::FullyAdmitted {
            if let Err(e) = self.set_membership(Mode::Revoke, identity) {
                warn!(address = %identity.source_address(), error = %e, "REVOKE_FAILED | set membership");
                failures.push(e);
            }
        }
        if state.is_applied() {
            if let Err(e) = self.set_filter(Mode::Revoke, identity) {
                warn!(address = %identity.source_address(), error = %e, "REVOKE_FAILED | filter");
                failures.push(e);
            }
        }

        failures
    }
}
