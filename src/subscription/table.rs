use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use tracing::info;

use super::SubscriptionEntry;
use super::SubscriptionState;
use crate::config::LockConfig;
use crate::lock::BoundedRwLock;
use crate::lock::HolderId;
use crate::lock::LockGuard;
use crate::shm::SharedStore;
use crate::shm::ShmPaths;
use crate::utils::process::process_alive;
use crate::Error;
use crate::Result;

/// Entries of one module, read while the Ext read lock is held.
///
/// The guard is reference counted so delivery threads can keep the table
/// stable for as long as they run, including after being abandoned.
pub struct SubscriberSnapshot {
    pub guard: Arc<LockGuard>,
    pub entries: Vec<SubscriptionEntry>,
}

/// Subscription table of one module.
pub struct SubscriptionTable {
    module: String,
    store: SharedStore<Vec<SubscriptionEntry>>,
}

impl SubscriptionTable {
    pub fn open(
        paths: &ShmPaths,
        module: &str,
        lock: LockConfig,
    ) -> Result<Self> {
        let store = SharedStore::open(
            format!("ext:{module}"),
            paths.subscription_region(module)?,
            paths.subscription_data(module)?,
            lock,
        )?;
        Ok(Self {
            module: module.to_string(),
            store,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn ext_lock(&self) -> &Arc<BoundedRwLock> {
        self.store.lock()
    }

    pub fn register(
        &self,
        entry: SubscriptionEntry,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if entry.module != self.module {
            return Err(Error::InvalidArgument(format!(
                "subscription for module {} registered in table of {}",
                entry.module, self.module
            )));
        }

        let txn = self.store.write(holder, timeout)?;
        let mut entries = (**txn.current()).clone();
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(Error::Exists(format!("subscription {}", entry.id)));
        }
        debug!(module = %self.module, %entry, "Registering subscription");
        entries.push(entry);
        txn.commit(entries)?;
        Ok(())
    }

    /// Removes entry `id` and compacts the table. An absent id is not an
    /// error, so a retry after a timed-out attempt succeeds. Returns whether
    /// this call removed it.
    pub fn unregister(
        &self,
        id: u64,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let txn = self.store.write(holder, timeout)?;
        let mut entries = (**txn.current()).clone();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            debug!(module = %self.module, id, "Subscription already gone");
            return Ok(false);
        }
        txn.commit(entries)?;
        debug!(module = %self.module, id, "Unregistered subscription");
        Ok(true)
    }

    /// Returns whether the entry exists.
    pub fn set_state(
        &self,
        id: u64,
        state: SubscriptionState,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let txn = self.store.write(holder, timeout)?;
        let mut entries = (**txn.current()).clone();
        let Some(entry) = entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        if entry.state == state {
            return Ok(true);
        }
        entry.state = state;
        txn.commit(entries)?;
        debug!(module = %self.module, id, ?state, "Subscription state changed");
        Ok(true)
    }

    /// Entries accepted by `filter`, highest priority first, then oldest.
    /// The Ext read lock stays held until the snapshot's guard is dropped.
    pub fn enumerate(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
        filter: impl Fn(&SubscriptionEntry) -> bool,
    ) -> Result<SubscriberSnapshot> {
        let txn = self.store.read(holder, timeout)?;
        let mut entries: Vec<SubscriptionEntry> = txn.value().iter().filter(|e| filter(e)).cloned().collect();
        entries.sort_by(|a, b| b.priority().cmp(&a.priority()).then(a.id.cmp(&b.id)));

        Ok(SubscriberSnapshot {
            guard: Arc::new(txn.into_guard()),
            entries,
        })
    }

    /// Current entries without keeping the lock.
    pub fn entries(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<Vec<SubscriptionEntry>> {
        Ok((*self.store.read(holder, timeout)?.into_value()).clone())
    }

    /// Drops entries whose owning process is gone; returns them.
    pub fn purge_dead(
        &self,
        holder: HolderId,
        timeout: Option<Duration>,
    ) -> Result<Vec<SubscriptionEntry>> {
        let txn = self.store.write(holder, timeout)?;
        let (alive, dead): (Vec<_>, Vec<_>) = txn
            .current()
            .iter()
            .cloned()
            .partition(|e| process_alive(e.owner_pid));
        if dead.is_empty() {
            return Ok(dead);
        }
        txn.commit(alive)?;
        for entry in &dead {
            info!(module = %self.module, %entry, pid = entry.owner_pid, "Purged subscription of dead process");
        }
        Ok(dead)
    }
}

/// Lazily opened subscription tables of one store.
pub struct SubscriptionTables {
    paths: ShmPaths,
    lock: LockConfig,
    tables: DashMap<String, Arc<SubscriptionTable>>,
}

impl SubscriptionTables {
    pub fn new(
        paths: ShmPaths,
        lock: LockConfig,
    ) -> Self {
        Self {
            paths,
            lock,
            tables: DashMap::new(),
        }
    }

    pub fn table(
        &self,
        module: &str,
    ) -> Result<Arc<SubscriptionTable>> {
        if let Some(table) = self.tables.get(module) {
            return Ok(table.clone());
        }
        let table = Arc::new(SubscriptionTable::open(&self.paths, module, self.lock.clone())?);
        Ok(self
            .tables
            .entry(module.to_string())
            .or_insert(table)
            .value()
            .clone())
    }

    /// Table of `module` only if some process ever created it.
    pub fn existing_table(
        &self,
        module: &str,
    ) -> Result<Option<Arc<SubscriptionTable>>> {
        if self.tables.contains_key(module) || self.paths.subscription_region(module)?.exists() {
            return self.table(module).map(Some);
        }
        Ok(None)
    }

    /// Modules with a table on disk, opened or not.
    pub fn known_modules(&self) -> Result<Vec<String>> {
        self.paths.known_modules()
    }
}
