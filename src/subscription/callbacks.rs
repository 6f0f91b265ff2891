use std::sync::Arc;

use dashmap::DashMap;
use lazy_static::lazy_static;

use crate::notify::ChangeEvent;
use crate::notify::NotificationEvent;
use crate::notify::OperGetRequest;
use crate::notify::RpcRequest;
use crate::tree::DataTree;
use crate::CallbackError;

pub type ModuleChangeCallback = Arc<dyn Fn(&ChangeEvent) -> Result<(), CallbackError> + Send + Sync>;
pub type OperGetCallback = Arc<dyn Fn(&OperGetRequest) -> Result<DataTree, CallbackError> + Send + Sync>;
pub type RpcCallback = Arc<dyn Fn(&RpcRequest) -> Result<DataTree, CallbackError> + Send + Sync>;
pub type NotificationCallback = Arc<dyn Fn(&NotificationEvent) -> Result<(), CallbackError> + Send + Sync>;

/// User code attached to a subscription entry.
#[derive(Clone)]
pub enum Callback {
    ModuleChange(ModuleChangeCallback),
    OperGet(OperGetCallback),
    Rpc(RpcCallback),
    Notification(NotificationCallback),
}

impl std::fmt::Debug for Callback {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let kind = match self {
            Callback::ModuleChange(_) => "ModuleChange",
            Callback::OperGet(_) => "OperGet",
            Callback::Rpc(_) => "Rpc",
            Callback::Notification(_) => "Notification",
        };
        f.debug_tuple("Callback").field(&kind).finish()
    }
}

lazy_static! {
    /// Callbacks registered by this process, keyed by store namespace and
    /// subscription id.
    static ref CALLBACKS: DashMap<(String, u64), Callback> = DashMap::new();
}

pub(crate) fn register_callback(
    namespace: &str,
    id: u64,
    callback: Callback,
) {
    CALLBACKS.insert((namespace.to_string(), id), callback);
}

pub(crate) fn remove_callback(
    namespace: &str,
    id: u64,
) -> Option<Callback> {
    CALLBACKS
        .remove(&(namespace.to_string(), id))
        .map(|(_, callback)| callback)
}

pub(crate) fn lookup_callback(
    namespace: &str,
    id: u64,
) -> Option<Callback> {
    CALLBACKS
        .get(&(namespace.to_string(), id))
        .map(|entry| entry.value().clone())
}
