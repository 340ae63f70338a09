// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session identity resolution.
//!
//! A [`SessionIdentity`] is the validated (source address, username) pair
//! that names one gatekeeper session. It is derived once at startup from
//! the SSH environment and the password database and is never mutated.
//!
//! Every check here fails closed: a value that does not fit is rejected,
//! never truncated.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use nix::unistd::{Uid, User};

use crate::config::AuthiptConfig;
use crate::error::IdentityError;

/// Primary connection variable set by sshd: `"<addr> <port> <local port>"`.
pub const SSH_CLIENT: &str = "SSH_CLIENT";
/// Newer four-field connection variable, consulted when `SSH_CLIENT` is absent.
pub const SSH_CONNECTION: &str = "SSH_CONNECTION";
/// Present only for sessions with a pseudo-terminal.
pub const SSH_TTY: &str = "SSH_TTY";

/// Validated identity of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    source_address: Ipv4Addr,
    username: String,
}

impl SessionIdentity {
    /// Build an identity, enforcing a non-empty, bounded username.
    pub fn new(
        source_address: Ipv4Addr,
        username: impl Into<String>,
        max_username_len: usize,
    ) -> Result<Self, IdentityError> {
        let username = username.into();
        if username.is_empty() {
            return Err(IdentityError::EmptyUsername);
        }
        if username.len() > max_username_len {
            return Err(IdentityError::UsernameTooLong {
                len: username.len(),
                max: max_username_len,
                user: username,
            });
        }
        Ok(Self {
            source_address,
            username,
        })
    }

    pub fn source_address(&self) -> Ipv4Addr {
        self.source_address
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The address in the textual form used for lock records and tool arguments.
    pub fn address_key(&self) -> String {
        self.source_address.to_string()
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.source_address)
    }
}

/// The invoking account, as recorded in the password database.
#[derive(Debug, Clone)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub shell: PathBuf,
}

impl Account {
    /// Look up the account for the real uid of this process.
    pub fn current() -> Result<Self, IdentityError> {
        let uid = Uid::current();
        match User::from_uid(uid).map_err(IdentityError::Lookup)? {
            Some(user) => Ok(Self {
                name: user.name,
                uid: uid.as_raw(),
                shell: user.shell,
            }),
            None => Err(IdentityError::UnknownUser(uid.as_raw())),
        }
    }
}

/// Extract the source address from an sshd connection descriptor.
///
/// The address is the first space-delimited field and at least one more
/// field must follow it; the remaining fields (ports) are discarded.
pub fn parse_connection(descriptor: &str) -> Result<Ipv4Addr, IdentityError> {
    let (address, rest) = descriptor
        .split_once(' ')
        .ok_or_else(|| IdentityError::MalformedConnection(descriptor.to_string()))?;
    if rest.trim().is_empty() {
        return Err(IdentityError::MalformedConnection(descriptor.to_string()));
    }
    // IPv6 is not supported by the membership set type in use.
    address
        .parse::<Ipv4Addr>()
        .map_err(|_| IdentityError::InvalidAddress(address.to_string()))
}

/// Resolve the session identity.
///
/// `env` is the environment lookup (normally `std::env::var`), `account`
/// the invoking account. Checks, in order: interactive session, connection
/// descriptor, IPv4 address, login shell, username bound, lock path bound.
pub fn resolve<F>(
    config: &AuthiptConfig,
    env: F,
    account: &Account,
) -> Result<SessionIdentity, IdentityError>
where
    F: Fn(&str) -> Option<String>,
{
    if env(SSH_TTY).is_none() {
        return Err(IdentityError::NotInteractive);
    }

    let descriptor = env(SSH_CLIENT)
        .or_else(|| env(SSH_CONNECTION))
        .ok_or(IdentityError::MissingConnection)?;
    let address = parse_connection(&descriptor)?;

    if account.shell != config.shell {
        return Err(IdentityError::WrongShell {
            user: account.name.clone(),
            uid: account.uid,
            shell: account.shell.clone(),
        });
    }

    let identity = SessionIdentity::new(address, account.name.as_str(), config.max_username_len)?;

    let lock_path = config.lock_dir.join(identity.address_key());
    let len = lock_path.as_os_str().len();
    if len >= config.max_path_len {
        return Err(IdentityError::LockPathTooLong {
            len,
            max: config.max_path_len,
        });
    }

    Ok(identity)
}

/// [`resolve`] against the real process environment and password database.
pub fn resolve_current(config: &AuthiptConfig) -> Result<SessionIdentity, IdentityError> {
    let account = Account::current()?;
    resolve(config, |key| std::env::var(key).ok(), &account)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn account(shell: &str) -> Account {
        Account {
            name: "alice".to_string(),
            uid: 1001,
            shell: PathBuf::from(shell),
        }
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_parse_connection() {
        assert_eq!(
            parse_connection("10.0.0.5 51234 22").unwrap(),
            Ipv4Addr::new(10, 0, 0, 5)
        );
        assert!(matches!(
            parse_connection("10.0.0.5"),
            Err(IdentityError::MalformedConnection(_))
        ));
        assert!(matches!(
            parse_connection("10.0.0.5 "),
            Err(IdentityError::MalformedConnection(_))
        ));
        assert!(matches!(
            parse_connection("fe80::1 51234 22"),
            Err(IdentityError::InvalidAddress(_))
        ));
        assert!(matches!(
            parse_connection("10.0.0.256 1 22"),
            Err(IdentityError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_resolve_happy_path() {
        let config = AuthiptConfig::default();
        let env = env_of(&[(SSH_TTY, "/dev/pts/3"), (SSH_CLIENT, "10.0.0.5 51234 22")]);
        let identity = resolve(&config, env, &account("/usr/sbin/authipt")).unwrap();
        assert_eq!(identity.username(), "alice");
        assert_eq!(identity.address_key(), "10.0.0.5");
        assert_eq!(identity.to_string(), "alice@10.0.0.5");
    }

    #[test]
    fn test_resolve_falls_back_to_ssh_connection() {
        let config = AuthiptConfig::default();
        let env = env_of(&[
            (SSH_TTY, "/dev/pts/3"),
            (SSH_CONNECTION, "192.168.2.44 40000 192.168.2.1 22"),
        ]);
        let identity = resolve(&config, env, &account("/usr/sbin/authipt")).unwrap();
        assert_eq!(identity.source_address(), Ipv4Addr::new(192, 168, 2, 44));
    }

    #[test]
    fn test_resolve_requires_tty() {
        let config = AuthiptConfig::default();
        let env = env_of(&[(SSH_CLIENT, "10.0.0.5 51234 22")]);
        assert!(matches!(
            resolve(&config, env, &account("/usr/sbin/authipt")),
            Err(IdentityError::NotInteractive)
        ));
    }

    #[test]
    fn test_resolve_requires_connection() {
        let config = AuthiptConfig::default();
        let env = env_of(&[(SSH_TTY, "/dev/pts/3")]);
        assert!(matches!(
            resolve(&config, env, &account("/usr/sbin/authipt")),
            Err(IdentityError::MissingConnection)
        ));
    }

    #[test]
    fn test_resolve_rejects_wrong_shell() {
        let config = AuthiptConfig::default();
        let env = env_of(&[(SSH_TTY, "/dev/pts/3"), (SSH_CLIENT, "10.0.0.5 51234 22")]);
        assert!(matches!(
            resolve(&config, env, &account("/bin/bash")),
            Err(IdentityError::WrongShell { .. })
        ));
    }

    #[test]
    fn test_username_bounds() {
        let addr = Ipv4Addr::new(10, 0, 0, 5);
        assert!(matches!(
            SessionIdentity::new(addr, "", 31),
            Err(IdentityError::EmptyUsername)
        ));
        assert!(SessionIdentity::new(addr, "a".repeat(31), 31).is_ok());
        assert!(matches!(
            SessionIdentity::new(addr, "a".repeat(32), 31),
            Err(IdentityError::UsernameTooLong { len: 32, max: 31, .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_long_lock_path() {
        let config = AuthiptConfig {
            max_path_len: 16,
            ..AuthiptConfig::default()
        };
        let env = env_of(&[(SSH_TTY, "/dev/pts/3"), (SSH_CLIENT, "10.0.0.5 51234 22")]);
        assert!(matches!(
            resolve(&config, env, &account("/usr/sbin/authipt")),
            Err(IdentityError::LockPathTooLong { .. })
        ));
    }
}
