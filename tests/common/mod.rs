use std::path::Path;
use std::time::Duration;

use dstore::config::LockConfig;
use dstore::Connection;
use dstore::DatastoreKind;
use dstore::DstoreConfig;
use dstore::EditOptions;
use dstore::GetFlags;
use dstore::Session;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Env var telling a re-executed test binary to act as a lock holder.
pub const CHILD_LOCK_PATH_ENV: &str = "DSTORE_TEST_CHILD_LOCK";
pub const CHILD_MODE_ENV: &str = "DSTORE_TEST_CHILD_MODE";
pub const CHILD_READY_ENV: &str = "DSTORE_TEST_CHILD_READY";

pub fn lock_config() -> LockConfig {
    LockConfig {
        spin_attempts: 8,
        base_delay_us: 100,
        probe_interval_us: 2_000,
        ext_lock_timeout_ms: 2_000,
    }
}

pub fn config(dir: &Path) -> DstoreConfig {
    let mut config = DstoreConfig::default();
    config.shm.dir = dir.to_path_buf();
    config.shm.prefix = "it".to_string();
    config.lock = lock_config();
    config.dispatch.callback_timeout_ms = 2_000;
    config.oper.pull_timeout_ms = 2_000;
    config
}

pub fn connect(dir: &Path) -> Connection {
    Connection::connect(config(dir)).unwrap()
}

/// Merges `value` at `path` and commits it in one go. Operational data
/// pushed this way lives as long as the returned session.
pub fn commit_item(
    conn: &Connection,
    datastore: DatastoreKind,
    path: &str,
    value: Option<&str>,
) -> Session {
    let mut session = conn.session_start(datastore).unwrap();
    session
        .set_item(path, value, EditOptions::default())
        .unwrap();
    session.apply_changes(TIMEOUT).unwrap();
    session
}

pub fn read(
    conn: &Connection,
    datastore: DatastoreKind,
    xpath: &str,
) -> dstore::DataTree {
    conn.session_start(datastore)
        .unwrap()
        .get_data(xpath, 0, TIMEOUT, GetFlags::default())
        .unwrap()
}
