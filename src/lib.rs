// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! authipt - authenticating gateway shell library
//!
//! authipt is installed as the login shell of gateway accounts. While the
//! user's SSH session is alive, the address it came from is admitted into
//! the packet filter and a membership set; when the session ends, by any
//! means, that admission is revoked exactly once.
//!
//! **Lock** -> **Admit (filter, then set)** -> **Hold** -> **Revoke (set, then filter)**
//!
//! # Core Modules
//!
//! - [`lock`] - Per-address exclusive lock records with polite eviction
//! - [`enforce`] - Filter and membership changes, with rollback
//! - [`lifecycle`] - Session state machine and the single teardown path
//! - [`signals`] - Termination flag raised by signal delivery
//! - [`identity`] - Session identity from the SSH environment
//! - [`messages`] - Greeting, ban and problem notices
//! - [`config`] - Gatekeeper configuration
//! - [`error`] - Error types

pub mod config;
pub mod enforce;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod messages;
pub mod signals;

pub use config::{AuthiptConfig, CONFIG_PATH};
pub use enforce::{AdmissionState, CommandRunner, Enforcer, Mode, SystemRunner};
pub use error::{ConfigError, ExecError, IdentityError, LockError};
pub use identity::{resolve_current, Account, SessionIdentity};
pub use lifecycle::{Gatekeeper, Outcome, Phase, PRECONDITION_EXIT_CODE};
pub use lock::{Evictor, HolderRecord, LockHandle, LockManager, SignalEvictor};
pub use messages::BanStatus;
pub use signals::TerminationFlag;
