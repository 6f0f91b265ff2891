//! Datastore kinds and the lock-protected stores behind them.


use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tracing::info;

use crate::config::LockConfig;
use crate::lock::HolderId;
use crate::oper::OperState;
use crate::shm::SharedStore;
use crate::shm::ShmPaths;
use crate::tree::DataTree;
use crate::utils::time::Deadline;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DatastoreKind {
    Startup,
    Running,
    Candidate,
    Operational,
}

impl DatastoreKind {
    pub const ALL: [DatastoreKind; 4] = [
        DatastoreKind::Startup,
        DatastoreKind::Running,
        DatastoreKind::Candidate,
        DatastoreKind::Operational,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreKind::Startup => "startup",
            DatastoreKind::Running => "running",
            DatastoreKind::Candidate => "candidate",
            DatastoreKind::Operational => "operational",
        }
    }

    /// Startup, running and candidate hold configuration trees.
    pub fn is_config(&self) -> bool {
        !matches!(self, DatastoreKind::Operational)
    }
}

impl fmt::Display for DatastoreKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatastoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DatastoreKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown datastore '{s}'")))
    }
}

/// One shared store per datastore kind.
///
/// Nested acquisitions always take the operational or candidate lock
/// before the running lock, never the other way round.
pub struct Datastores {
    startup: SharedStore<DataTree>,
    running: SharedStore<DataTree>,
    candidate: SharedStore<DataTree>,
    operational: SharedStore<OperState>,
}

impl Datastores {
    pub fn open(
        paths: &ShmPaths,
        lock: &LockConfig,
    ) -> Result<Self> {
        let config_store = |kind: DatastoreKind| -> Result<SharedStore<DataTree>> {
            SharedStore::open(
                kind.as_str(),
                paths.datastore_region(kind),
                paths.datastore_data(kind),
                lock.clone(),
            )
        };

        Ok(Self {
            startup: config_store(DatastoreKind::Startup)?,
            running: config_store(DatastoreKind::Running)?,
            candidate: config_store(DatastoreKind::Candidate)?,
            operational: SharedStore::open(
                DatastoreKind::Operational.as_str(),
                paths.datastore_region(DatastoreKind::Operational),
                paths.datastore_data(DatastoreKind::Operational),
                lock.clone(),
            )?,
        })
    }

    /// Store of a configuration datastore.
    pub fn config(
        &self,
        kind: DatastoreKind,
    ) -> Result<&SharedStore<DataTree>> {
        match kind {
            DatastoreKind::Startup => Ok(&self.startup),
            DatastoreKind::Running => Ok(&self.running),
            DatastoreKind::Candidate => Ok(&self.candidate),
            DatastoreKind::Operational => Err(Error::InvalidArgument(
                "operational datastore holds edit layers, not a configuration tree".to_string(),
            )),
        }
    }

    pub fn operational(&self) -> &SharedStore<OperState> {
        &self.operational
    }

    /// Committed tree of `kind`. Candidate mirrors running until it is
    /// written for the first time.
    pub fn read_config(
        &self,
        kind: DatastoreKind,
        holder: HolderId,
        deadline: &Deadline,
    ) -> Result<Arc<DataTree>> {
        let store = match kind {
            DatastoreKind::Candidate if !self.candidate.data_exists() => &self.running,
            _ => self.config(kind)?,
        };
        Ok(store.read(holder, deadline.remaining())?.into_value())
    }

    /// Seeds running from startup when running was never written.
    /// Returns whether a copy happened.
    pub fn copy_startup_if_needed(
        &self,
        holder: HolderId,
        deadline: &Deadline,
    ) -> Result<bool> {
        if self.running.data_exists() || !self.startup.data_exists() {
            return Ok(false);
        }

        let txn = self.running.write(holder, deadline.remaining())?;
        // another process may have seeded it while we waited
        if self.running.data_exists() {
            return Ok(false);
        }
        let startup = self.startup.read(holder, deadline.remaining())?.into_value();
        let copied = startup.len();
        txn.commit((*startup).clone())?;

        info!(nodes = copied, "Seeded running datastore from startup");
        Ok(true)
    }
}
