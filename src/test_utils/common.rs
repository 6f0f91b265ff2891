use std::path::Path;
use std::process::Child;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::config::DstoreConfig;
use crate::config::LockConfig;
use crate::lock::BoundedRwLock;
use crate::lock::HolderId;
use crate::notify::Dispatcher;
use crate::oper::OverlayEngine;
use crate::shm::SharedRegion;
use crate::shm::ShmPaths;
use crate::subscription::register_callback;
use crate::subscription::Callback;
use crate::subscription::SubscribeOptions;
use crate::subscription::SubscriptionEntry;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionState;
use crate::subscription::SubscriptionTables;
use crate::tree::DataTree;
use crate::tree::XPath;
use crate::utils::process::current_pid;
use crate::DatastoreKind;
use crate::Datastores;

/// Lock timings short enough for unit tests.
pub(crate) fn fast_lock_config() -> LockConfig {
    LockConfig {
        spin_attempts: 8,
        base_delay_us: 50,
        probe_interval_us: 1_000,
        ext_lock_timeout_ms: 1_000,
    }
}

/// Configuration rooted in `dir`, usually a tempdir owned by the test.
pub(crate) fn test_config(dir: &Path) -> DstoreConfig {
    let mut config = DstoreConfig::default();
    config.shm.dir = dir.to_path_buf();
    config.shm.prefix = "unit".to_string();
    config.lock = fast_lock_config();
    config.dispatch.callback_timeout_ms = 1_000;
    config.dispatch.done_timeout_ms = 1_000;
    config.dispatch.rpc_timeout_ms = 1_000;
    config.dispatch.notification_timeout_ms = 500;
    config.oper.pull_timeout_ms = 1_000;
    config
}

pub(crate) fn open_test_lock(
    dir: &Path,
    name: &str,
) -> Arc<BoundedRwLock> {
    let path = dir.join(format!("{name}.shm"));
    Arc::new(BoundedRwLock::open(name, path, fast_lock_config()).unwrap())
}

/// Pid of a process that has already exited.
pub(crate) fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Another live process, killed on drop.
pub(crate) struct ForeignProcess(Child);

impl ForeignProcess {
    pub(crate) fn spawn() -> Self {
        Self(Command::new("sleep").arg("30").spawn().unwrap())
    }

    pub(crate) fn pid(&self) -> u32 {
        self.0.id()
    }
}

impl Drop for ForeignProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

/// Tree holding `value` at every given path.
pub(crate) fn tree_of(leaves: &[(&str, Option<&str>)]) -> DataTree {
    let mut tree = DataTree::new();
    for (path, value) in leaves {
        let keys = XPath::parse(path).unwrap().to_keys().unwrap();
        tree.merge_path(&keys, value.map(str::to_string));
    }
    tree
}

/// Store components wired together the way a connection does, without
/// the connection itself.
pub(crate) struct StoreFixture {
    pub(crate) _dir: TempDir,
    pub(crate) config: DstoreConfig,
    pub(crate) namespace: String,
    pub(crate) main: Arc<SharedRegion>,
    pub(crate) datastores: Arc<Datastores>,
    pub(crate) tables: Arc<SubscriptionTables>,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl StoreFixture {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let paths = ShmPaths::new(&config.shm);
        let namespace = paths.namespace();
        let main = Arc::new(SharedRegion::open(paths.main_region()).unwrap());
        let datastores = Arc::new(Datastores::open(&paths, &config.lock).unwrap());
        let tables = Arc::new(SubscriptionTables::new(paths, config.lock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            namespace.clone(),
            main.clone(),
            tables.clone(),
            config.dispatch.clone(),
            &config.lock,
        ));
        Self {
            _dir: dir,
            config,
            namespace,
            main,
            datastores,
            tables,
            dispatcher,
        }
    }

    pub(crate) fn overlay(&self) -> OverlayEngine {
        OverlayEngine::new(
            self.datastores.clone(),
            self.tables.clone(),
            self.dispatcher.clone(),
            self.config.oper.clone(),
        )
    }

    /// Registers an active subscription of this process with `callback`.
    pub(crate) fn subscribe(
        &self,
        xpath: &str,
        kind: SubscriptionKind,
        datastore: DatastoreKind,
        options: SubscribeOptions,
        callback: Callback,
    ) -> u64 {
        let entry = self.entry(xpath, kind, datastore, options);
        let id = entry.id;
        register_callback(&self.namespace, id, callback);
        self.tables
            .table(&entry.module)
            .unwrap()
            .register(entry, HolderId::for_session(id), Some(Duration::from_secs(1)))
            .unwrap();
        id
    }

    /// Registers an active entry owned by `owner_pid`, with no local
    /// callback.
    pub(crate) fn register_foreign(
        &self,
        xpath: &str,
        kind: SubscriptionKind,
        datastore: DatastoreKind,
        options: SubscribeOptions,
        owner_pid: u32,
    ) -> u64 {
        let mut entry = self.entry(xpath, kind, datastore, options);
        entry.owner_pid = owner_pid;
        let id = entry.id;
        self.tables
            .table(&entry.module)
            .unwrap()
            .register(entry, HolderId::for_session(id), Some(Duration::from_secs(1)))
            .unwrap();
        id
    }

    pub(crate) fn entry(
        &self,
        xpath: &str,
        kind: SubscriptionKind,
        datastore: DatastoreKind,
        options: SubscribeOptions,
    ) -> SubscriptionEntry {
        let xpath = XPath::parse(xpath).unwrap();
        SubscriptionEntry {
            id: self.main.allocate_id(),
            module: xpath.module().unwrap().to_string(),
            xpath,
            kind,
            datastore,
            options,
            owner_pid: current_pid(),
            connection_id: 1,
            state: SubscriptionState::Active,
        }
    }

    pub(crate) fn commit_running(
        &self,
        tree: DataTree,
    ) {
        let store = self.datastores.config(DatastoreKind::Running).unwrap();
        let txn = store
            .write(HolderId::for_session(0), Some(Duration::from_secs(1)))
            .unwrap();
        txn.commit(tree).unwrap();
    }
}
