use serde::Deserialize;
use serde::Serialize;

use crate::tree::DataTree;
use crate::tree::Diff;
use crate::tree::XPath;
use crate::utils::time::Deadline;
use crate::DatastoreKind;

/// Stage of a change delivered to module-change subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Change is about to be committed; subscribers may still veto it
    Event,
    /// Change was committed
    Done,
    /// Change was vetoed after this subscriber accepted it
    Abort,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub subscription_id: u64,
    /// Same for every phase of one change
    pub request_id: u64,
    pub module: String,
    pub datastore: DatastoreKind,
    pub phase: Phase,
    /// Only the changes under the subscription's xpath
    pub diff: Diff,
    pub deadline: Deadline,
}

#[derive(Debug, Clone)]
pub struct OperGetRequest {
    pub subscription_id: u64,
    pub request_id: u64,
    pub module: String,
    /// Subtree this provider registered for
    pub xpath: XPath,
    /// What the reader asked for
    pub query: XPath,
    pub deadline: Deadline,
}

#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub subscription_id: u64,
    pub request_id: u64,
    pub path: XPath,
    pub input: DataTree,
    pub deadline: Deadline,
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub subscription_id: u64,
    pub path: XPath,
    pub content: DataTree,
    pub timestamp_ms: u64,
}
