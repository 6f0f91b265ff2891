use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Session;
use crate::config::DstoreConfig;
use crate::lock::HolderId;
use crate::notify::Dispatcher;
use crate::oper::OperState;
use crate::oper::OverlayEngine;
use crate::shm::SharedRegion;
use crate::shm::ShmPaths;
use crate::subscription::remove_callback;
use crate::subscription::SubscriptionTables;
use crate::tree::AcceptAll;
use crate::tree::DataTree;
use crate::tree::Diff;
use crate::tree::SchemaValidator;
use crate::utils::process::current_pid;
use crate::utils::time::Deadline;
use crate::DatastoreKind;
use crate::Datastores;
use crate::Error;
use crate::Result;

/// Process-side handle to a store. Sessions and subscriptions created from
/// it stay usable until [`Connection::disconnect`].
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    pub(crate) pid: u32,
    pub(crate) config: DstoreConfig,
    pub(crate) namespace: String,
    pub(crate) main: Arc<SharedRegion>,
    pub(crate) datastores: Arc<Datastores>,
    pub(crate) tables: Arc<SubscriptionTables>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) overlay: OverlayEngine,
    pub(crate) validator: Arc<dyn SchemaValidator>,
    /// (module, id) of subscriptions made through this connection
    subscriptions: Mutex<Vec<(String, u64)>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn connect(config: DstoreConfig) -> Result<Self> {
        Self::connect_with_validator(config, Arc::new(AcceptAll))
    }

    pub fn connect_with_validator(
        config: DstoreConfig,
        validator: Arc<dyn SchemaValidator>,
    ) -> Result<Self> {
        let config = config.validate()?;
        let paths = ShmPaths::new(&config.shm);
        let namespace = paths.namespace();

        let main = Arc::new(SharedRegion::open(paths.main_region())?);
        let datastores = Arc::new(Datastores::open(&paths, &config.lock)?);
        let tables = Arc::new(SubscriptionTables::new(paths, config.lock.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            namespace.clone(),
            main.clone(),
            tables.clone(),
            config.dispatch.clone(),
            &config.lock,
        ));
        let overlay = OverlayEngine::new(
            datastores.clone(),
            tables.clone(),
            dispatcher.clone(),
            config.oper.clone(),
        );

        let id = main.allocate_id();
        let deadline = Deadline::after(config.lock.ext_lock_timeout());
        datastores.copy_startup_if_needed(HolderId::for_session(id), &deadline)?;

        info!(connection_id = id, %namespace, "Connected");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                id,
                pid: current_pid(),
                config,
                namespace,
                main,
                datastores,
                tables,
                dispatcher,
                overlay,
                validator,
                subscriptions: Mutex::new(vec![]),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &DstoreConfig {
        &self.inner.config
    }

    pub fn session_start(
        &self,
        datastore: DatastoreKind,
    ) -> Result<Session> {
        self.inner.ensure_open()?;
        let id = self.inner.main.allocate_id();
        debug!(connection_id = self.inner.id, session_id = id, %datastore, "Session started");
        Ok(Session::new(self.inner.clone(), id, datastore))
    }

    /// Drops the operational data pushed through this connection and
    /// removes its subscriptions. Sessions still alive fail afterwards with
    /// [`Error::Disconnected`].
    pub fn disconnect(self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!(connection_id = self.inner.id, error = %e, "Cleanup on drop failed");
        }
    }
}

impl ConnectionInner {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Disconnected);
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ext_timeout(&self) -> Option<Duration> {
        self.config.lock.ext_lock_timeout()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let holder = HolderId::for_session(self.id);
        let deadline = Deadline::after(self.ext_timeout());

        let mut first_error = None;
        let (pid, id) = (self.pid, self.id);
        if let Err(e) = self.commit_oper(holder, &deadline, |state| {
            state.remove_connection(pid, id);
            Ok(())
        }) {
            first_error.get_or_insert(e);
        }

        let subscriptions: Vec<(String, u64)> = self.subscriptions.lock().drain(..).collect();
        for (module, sub_id) in subscriptions {
            if let Err(e) = self.unsubscribe(&module, sub_id, self.ext_timeout()) {
                warn!(connection_id = id, subscription_id = sub_id, error = %e, "Failed to unsubscribe");
                first_error.get_or_insert(e);
            }
        }

        info!(connection_id = id, "Disconnected");
        first_error.map_or(Ok(()), Err)
    }

    pub(crate) fn track_subscription(
        &self,
        module: &str,
        id: u64,
    ) {
        self.subscriptions.lock().push((module.to_string(), id));
    }

    /// Removes subscription `id`. Succeeds if it is already gone.
    pub(crate) fn unsubscribe(
        &self,
        module: &str,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let table = self.tables.table(module)?;
        table.unregister(id, HolderId::for_session(self.id), timeout)?;
        remove_callback(&self.namespace, id);
        self.subscriptions.lock().retain(|(_, tracked)| *tracked != id);
        Ok(())
    }

    /// Rewrites the operational edit layers with `mutate` and notifies
    /// subscribers of the resulting change in the operational view.
    pub(crate) fn commit_oper(
        &self,
        holder: HolderId,
        deadline: &Deadline,
        mutate: impl FnOnce(&mut OperState) -> Result<()>,
    ) -> Result<()> {
        let txn = self.datastores.operational().write(holder, deadline.remaining())?;
        let running = self
            .datastores
            .read_config(DatastoreKind::Running, holder, deadline)?;

        let mut state = (**txn.current()).clone();
        let purged = state.purge_dead();
        let before = OverlayEngine::stored_view(&running, &state)?;
        mutate(&mut state)?;
        if !purged.is_empty() {
            debug!(purged = purged.len(), "Dropped edit layers of dead processes");
        }
        if state == **txn.current() {
            return Ok(());
        }

        let after = OverlayEngine::stored_view(&running, &state)?;
        self.validator.validate(DatastoreKind::Operational, &after)?;
        let diff = Diff::between(&before, &after);
        if diff.is_empty() {
            txn.commit(state)?;
            return Ok(());
        }

        let changes = diff.len();
        self.dispatcher
            .run_commit(DatastoreKind::Operational, &diff, deadline, move || txn.commit(state))?;
        debug!(datastore = %DatastoreKind::Operational, changes, "Committed changes");
        Ok(())
    }

    /// Replaces the tree of a configuration datastore with `build(current)`,
    /// validating and notifying subscribers. Returns the number of changes.
    pub(crate) fn commit_config(
        &self,
        datastore: DatastoreKind,
        holder: HolderId,
        deadline: &Deadline,
        build: impl FnOnce(&DataTree) -> Result<DataTree>,
    ) -> Result<usize> {
        let store = self.datastores.config(datastore)?;
        // candidate starts out as a copy of running; read it before taking
        // the candidate lock so running is never locked inside it
        let fallback = if datastore == DatastoreKind::Candidate && !store.data_exists() {
            Some(self.datastores.read_config(DatastoreKind::Running, holder, deadline)?)
        } else {
            None
        };

        let txn = store.write(holder, deadline.remaining())?;
        let current = match fallback {
            Some(running) if !store.data_exists() => running,
            _ => txn.current().clone(),
        };

        let next = build(&current)?;
        self.validator.validate(datastore, &next)?;
        let diff = Diff::between(&current, &next);
        if diff.is_empty() {
            return Ok(0);
        }

        let changes = diff.len();
        self.dispatcher
            .run_commit(datastore, &diff, deadline, move || txn.commit(next))?;
        debug!(%datastore, changes, "Committed changes");
        Ok(changes)
    }
}
