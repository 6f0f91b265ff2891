//! Subscription tables guarded by per-module Ext locks.
//!
//! Each module has its own table in shared memory; the Ext lock of that
//! table is taken in write mode to change it and in read mode for the whole
//! of one delivery round, so an entry cannot vanish under a running
//! callback. Callbacks themselves stay in the registering process.

mod callbacks;
mod table;


pub use callbacks::*;
pub use table::*;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::tree::XPath;
use crate::DatastoreKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    ModuleChange,
    /// Pull provider of operational data
    OperGet,
    /// Caches the data of the pull provider with the same xpath
    OperPoll,
    Rpc,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    /// Registered, replaying current data; not yet notified
    Pending,
    Active,
    Suspended,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Higher priorities are notified first
    pub priority: u32,
    /// Replay the current data as a change right after subscribing
    pub enabled: bool,
    /// Only receive the DONE phase
    pub done_only: bool,
    /// A failing or late pull provider fails the whole read
    pub mandatory: bool,
    /// How long polled provider data is reused
    pub poll_valid_ms: u64,
}

impl SubscribeOptions {
    pub fn priority(
        mut self,
        priority: u32,
    ) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self) -> Self {
        self.enabled = true;
        self
    }

    pub fn done_only(mut self) -> Self {
        self.done_only = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionEntry {
    /// Allocated from the main region, never reused
    pub id: u64,
    pub module: String,
    pub xpath: XPath,
    pub kind: SubscriptionKind,
    pub datastore: DatastoreKind,
    pub options: SubscribeOptions,
    pub owner_pid: u32,
    pub connection_id: u64,
    pub state: SubscriptionState,
}

impl SubscriptionEntry {
    pub fn priority(&self) -> u32 {
        self.options.priority
    }

    pub fn is_active(&self) -> bool {
        self.state == SubscriptionState::Active
    }
}

impl fmt::Display for SubscriptionEntry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{:?}#{} {} ({})", self.kind, self.id, self.xpath, self.datastore)
    }
}
