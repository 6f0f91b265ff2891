use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use dstore::lock::BoundedRwLock;
use dstore::lock::HolderId;
use dstore::lock::LockMode;
use dstore::shm::ShmPaths;
use dstore::DatastoreKind;
use dstore::EditOptions;
use dstore::Error;
use dstore::LockError;

use crate::common::config;
use crate::common::connect;
use crate::common::lock_config;
use crate::common::read;
use crate::common::CHILD_LOCK_PATH_ENV;
use crate::common::CHILD_MODE_ENV;
use crate::common::CHILD_READY_ENV;
use crate::common::TIMEOUT;

/// Runs only inside a re-executed test binary: takes the lock named by the
/// environment and holds it until killed.
#[test]
fn child_lock_holder() {
    let Ok(lock_path) = std::env::var(CHILD_LOCK_PATH_ENV) else {
        return;
    };
    let mode = match std::env::var(CHILD_MODE_ENV).as_deref() {
        Ok("read") => LockMode::Read,
        _ => LockMode::Write,
    };
    let ready = std::env::var(CHILD_READY_ENV).unwrap();

    let lock = Arc::new(BoundedRwLock::open("running", lock_path, lock_config()).unwrap());
    let _guard = lock
        .acquire(mode, HolderId::for_session(1), Some(TIMEOUT))
        .unwrap();
    std::fs::write(ready, b"held").unwrap();
    thread::sleep(Duration::from_secs(120));
}

fn spawn_holder(
    lock_path: &Path,
    ready: &Path,
    mode: &str,
) -> Child {
    let mut child = Command::new(std::env::current_exe().unwrap())
        .args([
            "lock_recovery::child_lock_holder",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CHILD_LOCK_PATH_ENV, lock_path)
        .env(CHILD_MODE_ENV, mode)
        .env(CHILD_READY_ENV, ready)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let started = Instant::now();
    while !ready.exists() {
        if started.elapsed() > Duration::from_secs(20) {
            child.kill().unwrap();
            panic!("child never took the lock");
        }
        thread::sleep(Duration::from_millis(10));
    }
    child
}

fn kill(mut child: Child) {
    // SIGKILL: the child gets no chance to release anything
    child.kill().unwrap();
    child.wait().unwrap();
}

fn running_region(dir: &Path) -> PathBuf {
    ShmPaths::new(&config(dir).shm).datastore_region(DatastoreKind::Running)
}

#[test]
fn killed_writer_does_not_block_commits() {
    let dir = tempfile::tempdir().unwrap();
    let conn = connect(dir.path());
    let child = spawn_holder(&running_region(dir.path()), &dir.path().join("ready"), "write");
    let child_pid = child.id();

    let mut session = conn.session_start(DatastoreKind::Running).unwrap();
    session
        .set_item("/car:cars/car[name='a']/color", Some("red"), EditOptions::default())
        .unwrap();

    match session.apply_changes(Duration::from_millis(200)) {
        Err(Error::Lock(LockError::TimedOut { holders, .. })) => {
            assert!(holders.iter().any(|h| h.pid == child_pid && h.mode == LockMode::Write));
        }
        other => panic!("expected a lock timeout, got {other:?}"),
    }

    kill(child);
    session.apply_changes(TIMEOUT).unwrap();

    let view = read(&conn, DatastoreKind::Running, "/car:cars");
    assert_eq!(view.value("/car:cars/car[name='a']/color").unwrap(), Some("red"));
}

#[test]
fn killed_reader_does_not_starve_writers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("standalone.shm");
    let child = spawn_holder(&path, &dir.path().join("ready"), "read");

    let lock = Arc::new(BoundedRwLock::open("running", &path, lock_config()).unwrap());
    assert_eq!(lock.reader_count(), 1);
    // readers still share with the child
    drop(
        lock.acquire(LockMode::Read, HolderId::for_session(2), Some(TIMEOUT))
            .unwrap(),
    );
    let err = lock
        .acquire(LockMode::Write, HolderId::for_session(2), Some(Duration::from_millis(100)))
        .unwrap_err();
    assert!(err.is_timeout());
    // a failed writer leaves no trace
    assert!(!lock.is_write_locked());

    kill(child);
    let guard = lock
        .acquire(LockMode::Write, HolderId::for_session(2), Some(TIMEOUT))
        .unwrap();
    assert_eq!(lock.reader_count(), 0);
    assert_eq!(lock.holders().len(), 1);
    drop(guard);
}
