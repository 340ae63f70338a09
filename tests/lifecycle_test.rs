// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end session tests.
//!
//! The gatekeeper is driven with a recording command runner and a recording
//! evictor, so no firewall tool is executed and no process is signalled.
//! Lock records live in a temporary directory.

use std::fs;
use std::io::{self, Write};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use authipt::{
    AuthiptConfig, CommandRunner, Enforcer, Evictor, ExecError, Gatekeeper, HolderRecord,
    LockManager, Outcome, Phase, SessionIdentity, TerminationFlag,
};
use tempfile::TempDir;

// =============================================================================
// Test doubles
// =============================================================================

/// Records the verb of every tool call (`-N`, `up`, `-A`, `-D`, `down`).
#[derive(Clone, Default)]
struct RecordingRunner {
    calls: Arc<Mutex<Vec<String>>>,
    fail_on: Vec<&'static str>,
}

impl RecordingRunner {
    fn failing_on(verbs: &[&'static str]) -> Self {
        Self {
            fail_on: verbs.to_vec(),
            ..Self::default()
        }
    }

    fn verbs(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &Path, args: &[String]) -> Result<(), ExecError> {
        // Filter calls are "<user> up|down ...", set calls "-X <set> ...".
        let verb = if args[0].starts_with('-') {
            args[0].clone()
        } else {
            args[1].clone()
        };
        let fail = self.fail_on.contains(&verb.as_str());
        self.calls.lock().unwrap().push(verb);
        if fail {
            Err(ExecError::InvalidArgument {
                program: program.to_path_buf(),
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Default)]
struct RecordingEvictor {
    evicted: Arc<Mutex<Vec<i32>>>,
}

impl Evictor for RecordingEvictor {
    fn evict(&self, holder: &HolderRecord) -> io::Result<()> {
        self.evicted.lock().unwrap().push(holder.pid);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn test_config(dir: &TempDir) -> AuthiptConfig {
    AuthiptConfig {
        lock_dir: dir.path().join("locks"),
        user_dir: dir.path().join("users"),
        motd_file: dir.path().join("authipt.message"),
        problem_file: dir.path().join("authipt.problem"),
        lock_retry_ms: 1,
        hold_poll_ms: 5,
        unavailable_grace_secs: 0,
        banned_delay_secs: 0,
        reset_supplementary_groups: false,
        log_file: None,
        ..AuthiptConfig::default()
    }
}

fn alice() -> SessionIdentity {
    SessionIdentity::new(Ipv4Addr::new(10, 0, 0, 5), "alice", 31).unwrap()
}

struct Harness {
    gatekeeper: Gatekeeper<RecordingRunner, RecordingEvictor>,
    runner: RecordingRunner,
    evictor: RecordingEvictor,
    out: SharedBuf,
    flag: TerminationFlag,
}

fn harness(config: &AuthiptConfig, runner: RecordingRunner) -> Harness {
    let evictor = RecordingEvictor::default();
    let out = SharedBuf::default();
    let flag = TerminationFlag::detached();
    let gatekeeper = Gatekeeper::with_parts(
        config.clone(),
        alice(),
        flag,
        LockManager::with_evictor(config, evictor.clone()),
        Enforcer::with_runner(config, runner.clone()),
        Box::new(out.clone()),
    );
    Harness {
        gatekeeper,
        runner,
        evictor,
        out,
        flag,
    }
}

/// Raise the termination flag once this process has recorded itself as the
/// holder of `record`. The receiver reports whether that was observed.
fn end_session_once_recorded(record: &Path, flag: TerminationFlag) -> mpsc::Receiver<bool> {
    let record = record.to_path_buf();
    let expected = format!("{}\nalice\n", std::process::id());
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = false;
        while Instant::now() < deadline {
            if fs::read_to_string(&record).is_ok_and(|content| content == expected) {
                seen = true;
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let _ = tx.send(seen);
        flag.raise();
    });
    rx
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_admit_hold_and_revoke_on_termination() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::default());
    let record = config.lock_dir.join("10.0.0.5");

    let seen = end_session_once_recorded(&record, h.flag);
    let outcome = h.gatekeeper.run();

    assert_eq!(outcome, Outcome::Admitted);
    assert!(seen.recv().unwrap(), "lock record must name this process and alice");
    assert_eq!(h.runner.verbs(), vec!["-N", "up", "-A", "-D", "down"]);
    assert_eq!(h.gatekeeper.phase(), Phase::Terminated);
    assert!(!record.exists(), "lock record must be deleted on teardown");
    assert!(h.out.text().contains("Hello alice - you are authenticated from host 10.0.0.5."));
}

#[test]
fn test_live_competing_holder_times_out_without_enforcement() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);

    let other = LockManager::with_evictor(&config, RecordingEvictor::default());
    let mut held = other.acquire(&alice(), &TerminationFlag::detached()).unwrap();
    held.write_holder(999_999, "alice").unwrap();

    let mut h = harness(&config, RecordingRunner::default());
    let outcome = h.gatekeeper.run();

    assert_eq!(outcome, Outcome::Unavailable);
    assert!(h.runner.verbs().is_empty(), "no enforcement call may be made");
    assert_eq!(h.evictor.evicted.lock().unwrap().len(), 10);
    assert!(h.out.text().contains("technical difficulties"));

    assert!(held.is_held());
    assert_eq!(
        fs::read_to_string(held.path()).unwrap(),
        "999999\nalice\n",
        "a non-holder must not touch the record"
    );
}

#[test]
fn test_unusable_lock_dir_reports_unavailable_without_enforcement() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    fs::write(&config.lock_dir, "not a directory").unwrap();

    let mut h = harness(&config, RecordingRunner::default());
    assert_eq!(h.gatekeeper.run(), Outcome::Unavailable);

    assert!(h.runner.verbs().is_empty(), "no enforcement call may be made");
    assert!(h.evictor.evicted.lock().unwrap().is_empty());
    assert!(h.out.text().contains("technical difficulties"));
    assert_eq!(h.gatekeeper.phase(), Phase::Terminated);
}

#[test]
fn test_set_failure_compensates_filter_exactly_once() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::failing_on(&["-A"]));

    let outcome = h.gatekeeper.run();

    assert_eq!(outcome, Outcome::AdmissionFailed);
    assert_eq!(h.runner.verbs(), vec!["-N", "up", "-A", "down"]);
    assert_eq!(h.gatekeeper.admission(), authipt::AdmissionState::Unadmitted);
    assert!(!config.lock_dir.join("10.0.0.5").exists());
}

#[test]
fn test_filter_failure_makes_no_further_calls() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::failing_on(&["up"]));

    assert_eq!(h.gatekeeper.run(), Outcome::AdmissionFailed);
    assert_eq!(h.runner.verbs(), vec!["-N", "up"]);
}

#[test]
fn test_revocation_attempts_both_steps_when_first_fails() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::failing_on(&["-D"]));
    let record = config.lock_dir.join("10.0.0.5");

    let _seen = end_session_once_recorded(&record, h.flag);
    assert_eq!(h.gatekeeper.run(), Outcome::Admitted);
    assert_eq!(h.runner.verbs(), vec!["-N", "up", "-A", "-D", "down"]);
    assert!(!record.exists());
}

#[test]
fn test_repeated_teardown_does_not_revoke_twice() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::default());
    let record = config.lock_dir.join("10.0.0.5");

    let _seen = end_session_once_recorded(&record, h.flag);
    assert_eq!(h.gatekeeper.run(), Outcome::Admitted);
    let calls = h.runner.verbs().len();

    assert_eq!(h.gatekeeper.teardown(Outcome::Unavailable), Outcome::Admitted);
    assert_eq!(h.gatekeeper.teardown(Outcome::Denied), Outcome::Admitted);
    assert_eq!(h.runner.verbs().len(), calls);
    assert!(!h.gatekeeper.holds_lock());

    drop(h.gatekeeper);
    assert_eq!(h.runner.verbs().len(), calls);
}

#[test]
fn test_banned_user_is_never_admitted() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let home = config.user_home("alice");
    fs::create_dir_all(&home).unwrap();
    fs::write(home.join("banned"), "Contact the network team.\n").unwrap();

    let mut h = harness(&config, RecordingRunner::default());
    assert_eq!(h.gatekeeper.run(), Outcome::Denied);

    assert!(h.runner.verbs().is_empty());
    assert!(!config.lock_dir.join("10.0.0.5").exists());
    let text = h.out.text();
    assert!(text.contains("banned from authentication"));
    assert!(text.contains("Contact the network team."));
}

#[test]
fn test_stale_pid_is_replaced_before_ban_delay() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = AuthiptConfig {
        banned_delay_secs: 30,
        ..test_config(&dir)
    };
    fs::create_dir_all(&config.lock_dir).unwrap();
    let record = config.lock_dir.join("10.0.0.5");
    fs::write(&record, "31337\nbob\n").unwrap();
    let home = config.user_home("alice");
    fs::create_dir_all(&home).unwrap();
    fs::write(home.join("banned"), "Contact the network team.\n").unwrap();

    let mut h = harness(&config, RecordingRunner::default());
    let seen = end_session_once_recorded(&record, h.flag);
    let started = Instant::now();
    assert_eq!(h.gatekeeper.run(), Outcome::Denied);

    assert!(seen.recv().unwrap(), "record must name this process during the ban delay");
    assert!(started.elapsed() < Duration::from_secs(20));
    assert!(h.runner.verbs().is_empty());
    assert!(!record.exists());
}

#[test]
fn test_termination_before_admission_admits_nothing() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    let mut h = harness(&config, RecordingRunner::default());
    h.flag.raise();

    assert_eq!(h.gatekeeper.run(), Outcome::Cancelled);
    assert!(h.runner.verbs().is_empty());
    assert!(!config.lock_dir.join("10.0.0.5").exists());
}

#[test]
fn test_stale_unlocked_record_is_taken_over() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = test_config(&dir);
    fs::create_dir_all(&config.lock_dir).unwrap();
    let record = config.lock_dir.join("10.0.0.5");
    fs::write(&record, "31337\nbob\n").unwrap();

    let mut h = harness(&config, RecordingRunner::default());
    let seen = end_session_once_recorded(&record, h.flag);
    assert_eq!(h.gatekeeper.run(), Outcome::Admitted);
    assert!(seen.recv().unwrap());

    assert!(h.evictor.evicted.lock().unwrap().is_empty());
    assert_eq!(h.runner.verbs(), vec!["-N", "up", "-A", "-D", "down"]);
}

// =============================================================================
// Cross-session exclusion
// =============================================================================

#[test]
fn test_at_most_one_holder_per_address() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = AuthiptConfig {
        lock_attempts: 2000,
        lock_retry_ms: 2,
        ..test_config(&dir)
    };
    let holders = Arc::new(Mutex::new(0usize));
    let max_seen = Arc::new(Mutex::new(0usize));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            thread::spawn(move || {
                let manager = LockManager::with_evictor(&config, RecordingEvictor::default());
                for _ in 0..3 {
                    let mut handle = manager
                        .acquire(&alice(), &TerminationFlag::detached())
                        .expect("lock should eventually be granted");
                    {
                        let mut n = holders.lock().unwrap();
                        *n += 1;
                        let mut max = max_seen.lock().unwrap();
                        *max = (*max).max(*n);
                    }
                    thread::sleep(Duration::from_millis(5));
                    *holders.lock().unwrap() -= 1;
                    handle.release();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(*max_seen.lock().unwrap(), 1);
    assert!(!config.lock_dir.join("10.0.0.5").exists());
}
