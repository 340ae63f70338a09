// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admission Lock Manager.
//!
//! At most one process may hold admission for a source address. That
//! right is an exclusive `flock(2)` on `<lock_dir>/<address>`, a two-line
//! record naming the holder:
//!
//! ```text
//! 4242
//! alice
//! ```
//!
//! A contender that finds the record locked reads the holder's pid and asks
//! it to terminate (SIGTERM). The holder revokes its own admission, deletes
//! the record and exits; the contender retries once per interval up to a
//! fixed number of attempts, then gives up without admitting anyone.
//!
//! The record contents are only trustworthy while locked. An unlocked record
//! may be left over from a crashed holder and is simply taken over.

use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::AuthiptConfig;
use crate::error::LockError;
use crate::identity::SessionIdentity;
use crate::signals::TerminationFlag;

/// Mode the record is created with (before umask).
const RECORD_CREATE_MODE: u32 = 0o664;
/// Mode the record is forced to after opening.
const RECORD_MODE: u32 = 0o660;

/// Holder pid reported when the record cannot be read or parsed.
pub const UNKNOWN_PID: i32 = -1;

/// Contents of a lock record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderRecord {
    pub pid: i32,
    pub username: Option<String>,
}

impl HolderRecord {
    pub fn unknown() -> Self {
        Self {
            pid: UNKNOWN_PID,
            username: None,
        }
    }

    /// Parse `"<pid>\n<username>\n"`. Anything else yields [`HolderRecord::unknown`].
    pub fn parse(content: &str) -> Self {
        let mut lines = content.lines();
        let pid = lines.next().and_then(|l| l.trim().parse::<i32>().ok());
        let username = lines
            .next()
            .map(str::trim)
            .filter(|u| !u.is_empty() && !u.contains(char::is_whitespace));

        match (pid, username) {
            (Some(pid), Some(username)) => Self {
                pid,
                username: Some(username.to_string()),
            },
            _ => Self::unknown(),
        }
    }

    pub fn render(pid: i32, username: &str) -> String {
        format!("{}\n{}\n", pid, username)
    }

    pub fn is_known(&self) -> bool {
        self.pid > 0
    }
}

/// Asks the current holder of a lock record to let go.
pub trait Evictor {
    fn evict(&self, holder: &HolderRecord) -> io::Result<()>;
}

/// Polite eviction: SIGTERM, so the holder runs its own revocation first.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalEvictor;

impl Evictor for SignalEvictor {
    fn evict(&self, holder: &HolderRecord) -> io::Result<()> {
        kill(Pid::from_raw(holder.pid), Signal::SIGTERM).map_err(io::Error::from)
    }
}

/// Acquires per-address lock records.
#[derive(Debug)]
pub struct LockManager<E = SignalEvictor> {
    dir: PathBuf,
    attempts: u32,
    retry_interval: Duration,
    own_pid: i32,
    evictor: E,
}

impl LockManager<SignalEvictor> {
    pub fn from_config(config: &AuthiptConfig) -> Self {
        Self::with_evictor(config, SignalEvictor)
    }
}

impl<E: Evictor> LockManager<E> {
    pub fn with_evictor(config: &AuthiptConfig, evictor: E) -> Self {
        Self {
            dir: config.lock_dir.clone(),
            attempts: config.lock_attempts.max(1),
            retry_interval: config.lock_retry_interval(),
            own_pid: std::process::id() as i32,
            evictor,
        }
    }

    pub fn record_path(&self, identity: &SessionIdentity) -> PathBuf {
        self.dir.join(identity.address_key())
    }

    /// Take exclusive admission rights for `identity`'s address.
    ///
    /// Every attempt reopens the record, because an evicted holder unlinks
    /// it on the way out. Gives up with [`LockError::TimedOut`] after the
    /// configured number of attempts, or as soon as `flag` is raised.
    pub fn acquire(
        &self,
        identity: &SessionIdentity,
        flag: &TerminationFlag,
    ) -> Result<LockHandle, LockError> {
        let path = self.record_path(identity);
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|e| LockError::io(&self.dir, e))?;
        }

        let mut holder = HolderRecord::unknown();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let file = open_record(&path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    if still_linked(&file, &path)? {
                        debug!(path = %path.display(), attempt, "LOCK_ACQUIRED");
                        return Ok(LockHandle {
                            path,
                            file: Some(file),
                        });
                    }
                    // The previous holder unlinked the record between our
                    // open and our lock; the lock we got guards nothing.
                    debug!(path = %path.display(), "lock record vanished under us, reopening");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    holder = read_holder(&file);
                    debug!(
                        path = %path.display(),
                        holder_pid = holder.pid,
                        attempt,
                        "tried to lock record, in use"
                    );
                    self.evict(identity, &holder);
                }
                Err(e) => return Err(LockError::io(&path, e)),
            }
            drop(file);

            if flag.is_raised() || attempt >= self.attempts {
                break;
            }
            thread::sleep(self.retry_interval);
        }

        if flag.is_raised() {
            info!(address = %identity.source_address(), "termination requested while waiting for lock");
        } else {
            error!(
                address = %identity.source_address(),
                holder_pid = holder.pid,
                attempts = attempt,
                "LOCK_TIMEOUT | could not evict previous holder"
            );
        }
        Err(LockError::TimedOut {
            path,
            attempts: attempt,
            holder_pid: holder.pid,
        })
    }

    fn evict(&self, identity: &SessionIdentity, holder: &HolderRecord) {
        if !holder.is_known() || holder.pid == self.own_pid {
            return;
        }
        info!(
            holder_user = holder.username.as_deref().unwrap_or("?"),
            address = %identity.source_address(),
            holder_pid = holder.pid,
            "EVICTING | killing existing authentication"
        );
        if let Err(e) = self.evictor.evict(holder) {
            info!(holder_pid = holder.pid, error = %e, "could not signal previous holder");
        }
    }
}

fn open_record(path: &Path) -> Result<File, LockError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(RECORD_CREATE_MODE)
        .open(path)
        .map_err(|e| {
            error!(path = %path.display(), error = %e, "cannot open or create lock record");
            LockError::io(path, e)
        })?;

    if let Err(e) = file.set_permissions(Permissions::from_mode(RECORD_MODE)) {
        debug!(path = %path.display(), error = %e, "could not set lock record mode");
    }
    Ok(file)
}

/// Does `path` still name the inode `file` refers to?
fn still_linked(file: &File, path: &Path) -> Result<bool, LockError> {
    let opened = file.metadata().map_err(|e| LockError::io(path, e))?;
    match fs::metadata(path) {
        Ok(current) => Ok(current.dev() == opened.dev() && current.ino() == opened.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Best-effort read of a record we do not hold.
fn read_holder(file: &File) -> HolderRecord {
    let mut reader = file;
    let mut content = String::new();
    if reader.seek(SeekFrom::Start(0)).is_err() || reader.read_to_string(&mut content).is_err() {
        return HolderRecord::unknown();
    }
    HolderRecord::parse(&content)
}

/// Exclusive ownership of one lock record.
///
/// Dropping the handle releases it, so the record is removed on every exit
/// path that unwinds normally. If the process dies outright the kernel
/// drops the `flock` and the stale record is taken over by the next login.
#[derive(Debug)]
pub struct LockHandle {
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Overwrite the record with this holder's identity so contenders can
    /// find and evict it.
    pub fn write_holder(&mut self, pid: i32, username: &str) -> Result<(), LockError> {
        let file = self.file.as_mut().ok_or_else(|| {
            LockError::io(
                &self.path,
                io::Error::new(io::ErrorKind::Other, "lock already released"),
            )
        })?;
        let content = HolderRecord::render(pid, username);

        let path = &self.path;
        file.seek(SeekFrom::Start(0)).map_err(|e| LockError::io(path, e))?;
        file.write_all(content.as_bytes()).map_err(|e| LockError::io(path, e))?;
        file.flush().map_err(|e| LockError::io(path, e))?;
        let end = file.stream_position().map_err(|e| LockError::io(path, e))?;
        file.set_len(end).map_err(|e| LockError::io(path, e))?;
        Ok(())
    }

    /// Delete the record and drop the lock. Returns whether anything was
    /// released; a second call is a no-op.
    pub fn release(&mut self) -> bool {
        let Some(file) = self.file.take() else {
            return false;
        };

        // Unlink while still locked: a contender that opened the old inode
        // sees it is no longer linked and reopens.
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "lock record already gone");
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "could not unlink lock record");
            }
        }
        if let Err(e) = FileExt::unlock(&file) {
            debug!(path = %self.path.display(), error = %e, "explicit unlock failed");
        }
        drop(file);
        debug!(path = %self.path.display(), "LOCK_RELEASED");
        true
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
