// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lifecycle State Machine.
//!
//! ```text
//! Starting -> Locking -> Admitting -> Holding -> Revoking -> Terminated
//!                |            |
//!                +------------+--------------------------> Terminated
//! ```
//!
//! The gatekeeper takes the per-address lock, admits the address, then
//! sleeps until the termination flag is raised. Every path ends in
//! [`Gatekeeper::teardown`], the only place that revokes admission and
//! releases the lock. Teardown is idempotent: calling it again (or dropping
//! the gatekeeper afterwards) does nothing.

use std::ffi::CString;
use std::fmt;
use std::io::{self, Write};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::AuthiptConfig;
use crate::enforce::{AdmissionState, CommandRunner, Enforcer, SystemRunner};
use crate::identity::SessionIdentity;
use crate::lock::{Evictor, LockHandle, LockManager, SignalEvictor};
use crate::messages;
use crate::signals::TerminationFlag;

/// Exit status used for environment/precondition failures in strict mode.
pub const PRECONDITION_EXIT_CODE: i32 = 1;

/// Where the session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Locking,
    Admitting,
    Holding,
    Revoking,
    Terminated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Starting => write!(f, "STARTING"),
            Phase::Locking => write!(f, "LOCKING"),
            Phase::Admitting => write!(f, "ADMITTING"),
            Phase::Holding => write!(f, "HOLDING"),
            Phase::Revoking => write!(f, "REVOKING"),
            Phase::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Admitted, held, and revoked after a termination request
    Admitted,
    /// Terminated before admission was attempted
    Cancelled,
    /// Explicit policy denial (ban marker)
    Denied,
    /// Lock could not be obtained or the lock record could not be written
    Unavailable,
    /// An enforcement tool failed during admission
    AdmissionFailed,
}

impl Outcome {
    /// Process exit status. Always 0 unless `strict` is set.
    pub fn exit_code(&self, strict: bool) -> i32 {
        if !strict {
            return 0;
        }
        match self {
            Outcome::Admitted | Outcome::Cancelled => 0,
            Outcome::Denied => 2,
            Outcome::Unavailable => 3,
            Outcome::AdmissionFailed => 4,
        }
    }
}

/// One gatekeeper session.
pub struct Gatekeeper<R = SystemRunner, E = SignalEvictor>
where
    R: CommandRunner,
    E: Evictor,
{
    config: AuthiptConfig,
    identity: SessionIdentity,
    flag: TerminationFlag,
    locks: LockManager<E>,
    enforcer: Enforcer<R>,
    out: Box<dyn Write>,
    phase: Phase,
    admission: AdmissionState,
    lock: Option<LockHandle>,
    outcome: Option<Outcome>,
    admitted_at: Option<Instant>,
}

impl Gatekeeper<SystemRunner, SignalEvictor> {
    /// A gatekeeper wired to the real tools, SIGTERM eviction and stdout.
    pub fn new(config: AuthiptConfig, identity: SessionIdentity, flag: TerminationFlag) -> Self {
        let locks = LockManager::from_config(&config);
        let enforcer = Enforcer::from_config(&config);
        Self::with_parts(config, identity, flag, locks, enforcer, Box::new(io::stdout()))
    }
}

impl<R: CommandRunner, E: Evictor> Gatekeeper<R, E> {
    pub fn with_parts(
        config: AuthiptConfig,
        identity: SessionIdentity,
        flag: TerminationFlag,
        locks: LockManager<E>,
        enforcer: Enforcer<R>,
        out: Box<dyn Write>,
    ) -> Self {
        Self {
            config,
            identity,
            flag,
            locks,
            enforcer,
            out,
            phase: Phase::Starting,
            admission: AdmissionState::Unadmitted,
            lock: None,
            outcome: None,
            admitted_at: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn admission(&self) -> AdmissionState {
        self.admission
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn enforcer(&self) -> &Enforcer<R> {
        &self.enforcer
    }

    /// Whether this session currently holds the address lock.
    pub fn holds_lock(&self) -> bool {
        self.lock.as_ref().is_some_and(LockHandle::is_held)
    }

    /// Drive the session from start to [`Phase::Terminated`].
    pub fn run(&mut self) -> Outcome {
        if self.phase != Phase::Starting {
            return self.teardown(self.outcome.unwrap_or(Outcome::Cancelled));
        }

        self.enter(Phase::Locking);
        if let Err(outcome) = self.lock_phase() {
            return self.teardown(outcome);
        }
        if self.flag.is_raised() {
            return self.teardown(Outcome::Cancelled);
        }

        self.enter(Phase::Admitting);
        if let Err(outcome) = self.admit_phase() {
            return self.teardown(outcome);
        }

        self.enter(Phase::Holding);
        self.hold();
        self.teardown(Outcome::Admitted)
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = %self.phase, to = %phase, session = %self.identity, "PHASE");
        self.phase = phase;
    }

    fn lock_phase(&mut self) -> Result<(), Outcome> {
        let mut handle = match self.locks.acquire(&self.identity, &self.flag) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = %self.identity, error = %e, "LOCK_FAILED");
                if !self.flag.is_raised() {
                    self.report_unavailable();
                }
                return Err(Outcome::Unavailable);
            }
        };

        // Replace any stale pid before anything else can delay us, so a
        // contender never signals a pid left by a crashed holder.
        let pid = std::process::id() as i32;
        let written = handle.write_holder(pid, self.identity.username());
        self.lock = Some(handle);
        if let Err(e) = written {
            error!(error = %e, "could not record lock holder");
            self.report_unavailable();
            return Err(Outcome::Unavailable);
        }

        if self.config.reset_supplementary_groups {
            if let Err(e) = reset_supplementary_groups() {
                error!(error = %e, "setgroups failed");
                return Err(Outcome::Unavailable);
            }
        }

        let ban = messages::check_banned(&self.config, self.identity.username());
        if ban.is_denied() {
            info!(user = self.identity.username(), "User was not allowed to authenticate");
            self.emit(|out| messages::write_banned_notice(out, &ban));
            self.idle(self.config.banned_delay());
            return Err(Outcome::Denied);
        }
        Ok(())
    }

    fn admit_phase(&mut self) -> Result<(), Outcome> {
        match self.enforcer.admit(&self.identity) {
            Ok(state) => self.admission = state,
            Err(e) => {
                warn!(session = %self.identity, error = %e, "admission failed, session not admitted");
                self.admission = AdmissionState::Unadmitted;
                self.emit(messages::write_admission_failed);
                return Err(Outcome::AdmissionFailed);
            }
        }

        self.admitted_at = Some(Instant::now());
        info!(
            user = self.identity.username(),
            address = %self.identity.source_address(),
            "USER_AUTHENTICATED"
        );
        let (config, identity) = (&self.config, &self.identity);
        if let Err(e) = messages::write_greeting(&mut *self.out, config, identity) {
            debug!(error = %e, "could not write greeting");
        }
        set_process_title(&self.identity);
        Ok(())
    }

    /// Sleep until the termination flag is raised. There is no other way out.
    fn hold(&self) {
        let poll = self.config.hold_poll_interval();
        while !self.flag.is_raised() {
            thread::sleep(poll);
        }
        debug!(session = %self.identity, "termination requested");
    }

    /// Sleep for `total`, waking early if the termination flag is raised.
    fn idle(&self, total: Duration) {
        let slice = self.config.hold_poll_interval().min(total.max(Duration::from_millis(1)));
        let start = Instant::now();
        while start.elapsed() < total && !self.flag.is_raised() {
            thread::sleep(slice);
        }
    }

    fn report_unavailable(&mut self) {
        let pid = std::process::id();
        let config = &self.config;
        if let Err(e) = messages::write_unavailable_notice(&mut *self.out, config, pid) {
            debug!(error = %e, "could not write unavailable notice");
        }
        self.idle(self.config.unavailable_grace());
    }

    fn emit<F>(&mut self, write: F)
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        if let Err(e) = write(&mut *self.out) {
            debug!(error = %e, "could not write to terminal");
        }
    }

    /// The single cleanup path.
    ///
    /// Revokes whatever admission is applied, releases the lock if this
    /// session holds it, and records the outcome. Later calls return the
    /// first outcome and touch nothing.
    pub fn teardown(&mut self, outcome: Outcome) -> Outcome {
        if self.phase == Phase::Terminated {
            return self.outcome.unwrap_or(outcome);
        }

        if self.admission.is_applied() {
            self.enter(Phase::Revoking);
            let failures = self.enforcer.revoke(&self.identity, self.admission);
            self.admission = AdmissionState::Revoked;
            let held_secs = self.admitted_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
            info!(
                user = self.identity.username(),
                address = %self.identity.source_address(),
                held_secs,
                failures = failures.len(),
                "USER_DEAUTHENTICATED | no longer authenticated"
            );
        }

        if let Some(mut handle) = self.lock.take() {
            handle.release();
        }

        self.enter(Phase::Terminated);
        self.outcome = Some(outcome);
        outcome
    }
}

impl<R: CommandRunner, E: Evictor> Drop for Gatekeeper<R, E> {
    fn drop(&mut self) {
        if self.phase != Phase::Terminated && self.phase != Phase::Starting {
            warn!(phase = %self.phase, "gatekeeper dropped before teardown, cleaning up");
            self.teardown(Outcome::Cancelled);
        }
    }
}

/// Reset the supplementary group list to just the effective group.
fn reset_supplementary_groups() -> nix::Result<()> {
    let gid = nix::unistd::getegid();
    nix::unistd::setgroups(&[gid])
}

/// Rename the process to `user@address` (the kernel keeps 15 bytes).
fn set_process_title(identity: &SessionIdentity) {
    let Ok(title) = CString::new(identity.to_string()) else {
        return;
    };
    if let Err(e) = nix::sys::prctl::set_name(&title) {
        debug!(error = %e, "could not set process name");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_default_to_zero() {
        for outcome in [
            Outcome::Admitted,
            Outcome::Cancelled,
            Outcome::Denied,
            Outcome::Unavailable,
            Outcome::AdmissionFailed,
        ] {
            assert_eq!(outcome.exit_code(false), 0);
        }
    }

    #[test]
    fn test_strict_exit_codes_are_distinct() {
        assert_eq!(Outcome::Admitted.exit_code(true), 0);
        assert_eq!(Outcome::Denied.exit_code(true), 2);
        assert_eq!(Outcome::Unavailable.exit_code(true), 3);
        assert_eq!(Outcome::AdmissionFailed.exit_code(true), 4);
        assert_ne!(PRECONDITION_EXIT_CODE, 0);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Holding.to_string(), "HOLDING");
        assert_eq!(Phase::Terminated.to_string(), "TERMINATED");
    }
}
