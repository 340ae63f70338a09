// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Termination flag and signal handler installation.
//!
//! Signal delivery does exactly one thing: an atomic store into a
//! process-wide flag. Revocation, lock release and exit all happen later,
//! when the lifecycle polls the flag from ordinary control flow.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

/// Signals that request termination of the session.
pub const TERMINATION_SIGNALS: [Signal; 7] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGALRM,
    Signal::SIGPIPE,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
];

static PROCESS_FLAG: AtomicBool = AtomicBool::new(false);

extern "C" fn raise_process_flag(_sig: nix::libc::c_int) {
    // Only async-signal-safe work is allowed here.
    PROCESS_FLAG.store(true, Ordering::SeqCst);
}

/// A shared "please terminate" flag.
///
/// Copies are cheap and all observe the same underlying boolean. Raising it
/// more than once is harmless.
#[derive(Debug, Clone, Copy)]
pub struct TerminationFlag {
    inner: &'static AtomicBool,
}

impl TerminationFlag {
    /// The flag raised by the installed signal handlers.
    pub fn process() -> Self {
        Self {
            inner: &PROCESS_FLAG,
        }
    }

    /// A flag not connected to any signal handler.
    ///
    /// Used to drive the lifecycle from tests or an embedding program; the
    /// boolean is leaked so it can be shared as freely as the process flag.
    pub fn detached() -> Self {
        Self {
            inner: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    pub fn raise(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Route every signal in [`TERMINATION_SIGNALS`] to the process flag.
///
/// Returns the flag. A signal whose handler cannot be installed is logged
/// and skipped; the remaining ones still work.
pub fn install() -> TerminationFlag {
    for sig in TERMINATION_SIGNALS {
        // SAFETY: the handler performs a single atomic store, which is
        // async-signal-safe, and touches no other state.
        let result = unsafe { signal::signal(sig, SigHandler::Handler(raise_process_flag)) };
        if let Err(e) = result {
            tracing::warn!(signal = ?sig, error = %e, "SIGNAL_HANDLER_FAILED | could not install handler");
        }
    }
    TerminationFlag::process()
}
