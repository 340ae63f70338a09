// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gatekeeper configuration.
//!
//! Configuration is read from a fixed, root-owned path. The location is
//! deliberately not selectable from the command line: authipt runs with
//! elevated privilege on behalf of an ordinary user, and the config names
//! the programs it executes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fixed location of the configuration file.
pub const CONFIG_PATH: &str = "/etc/authipt/authipt.json";

/// All tunables of the gatekeeper. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthiptConfig {
    /// Directory holding one lock record per source address
    pub lock_dir: PathBuf,
    /// Per-user directory root (`<user_dir>/<user>/banned`, `.../motd`)
    pub user_dir: PathBuf,
    /// Greeting shown when the user has no personal motd
    pub motd_file: PathBuf,
    /// Message shown when authentication is unavailable
    pub problem_file: PathBuf,
    /// Login shell an account must have to be served
    pub shell: PathBuf,
    /// Filter modification tool
    pub filter_tool: PathBuf,
    /// Set management tool
    pub set_tool: PathBuf,
    /// Name of the membership set
    pub set_name: String,
    /// Type passed when creating the membership set
    pub set_type: String,

    /// Lock attempts before giving up on a competing holder
    pub lock_attempts: u32,
    /// Pause between lock attempts, in milliseconds
    pub lock_retry_ms: u64,
    /// Termination flag poll interval while holding admission, in milliseconds
    pub hold_poll_ms: u64,
    /// How long to keep the session open after an "unavailable" notice
    pub unavailable_grace_secs: u64,
    /// Delay before a banned user is disconnected
    pub banned_delay_secs: u64,

    pub max_username_len: usize,
    pub max_path_len: usize,

    /// Reset the supplementary group list after taking the lock
    pub reset_supplementary_groups: bool,
    /// Map outcomes to distinct exit codes instead of always exiting 0
    pub strict_exit_codes: bool,

    /// Log destination; stderr is used when unset or unwritable
    pub log_file: Option<PathBuf>,
    /// One of trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for AuthiptConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from("/var/authipt"),
            user_dir: PathBuf::from("/etc/authipt/users"),
            motd_file: PathBuf::from("/etc/authipt/authipt.message"),
            problem_file: PathBuf::from("/etc/authipt/authipt.problem"),
            shell: PathBuf::from("/usr/sbin/authipt"),
            filter_tool: PathBuf::from("/usr/sbin/authipt-modfilter"),
            set_tool: PathBuf::from("/usr/sbin/ipset"),
            set_name: "authipt".to_string(),
            set_type: "iphash".to_string(),
            lock_attempts: 10,
            lock_retry_ms: 1000,
            hold_poll_ms: 1000,
            unavailable_grace_secs: 180,
            banned_delay_secs: 10,
            max_username_len: 31,
            max_path_len: 4096,
            reset_supplementary_groups: true,
            strict_exit_codes: false,
            log_file: Some(PathBuf::from("/var/log/authipt.log")),
            log_level: "info".to_string(),
        }
    }
}

impl AuthiptConfig {
    /// Load from [`CONFIG_PATH`], falling back to defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_PATH))
    }

    /// Load from an explicit path. A missing file yields the defaults; a
    /// present but malformed file is an error so a typo never silently
    /// reverts to built-in tool paths.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the lock protocol or the enforcement
    /// calls meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "lock_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.hold_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "hold_poll_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.set_name.is_empty() || self.set_name.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "set_name",
                reason: format!("{:?} is not a usable set name", self.set_name),
            });
        }
        for (field, path) in [
            ("lock_dir", &self.lock_dir),
            ("filter_tool", &self.filter_tool),
            ("set_tool", &self.set_tool),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{:?} must be an absolute path", path),
                });
            }
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid {
                field: "log_level",
                reason: format!("unknown level {:?}", self.log_level),
            });
        }
        Ok(())
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn hold_poll_interval(&self) -> Duration {
        Duration::from_millis(self.hold_poll_ms)
    }

    pub fn unavailable_grace(&self) -> Duration {
        Duration::from_secs(self.unavailable_grace_secs)
    }

    pub fn banned_delay(&self) -> Duration {
        Duration::from_secs(self.banned_delay_secs)
    }

    /// `<user_dir>/<user>`
    pub fn user_home(&self, username: &str) -> PathBuf {
        self.user_dir.join(username)
    }
}
