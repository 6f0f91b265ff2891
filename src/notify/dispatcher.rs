use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::invoke_with_deadline;
use super::CallbackOutcome;
use super::ChangeEvent;
use super::NotificationEvent;
use super::Phase;
use super::RpcRequest;
use crate::config::DispatchConfig;
use crate::config::LockConfig;
use crate::lock::HolderId;
use crate::lock::LockGuard;
use crate::shm::SharedRegion;
use crate::subscription::lookup_callback;
use crate::subscription::Callback;
use crate::subscription::ModuleChangeCallback;
use crate::subscription::SubscriptionEntry;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionTable;
use crate::subscription::SubscriptionTables;
use crate::tree::DataTree;
use crate::tree::Diff;
use crate::tree::XPath;
use crate::utils::process::current_pid;
use crate::utils::process::process_alive;
use crate::utils::time::timestamp_millis;
use crate::utils::time::Deadline;
use crate::CallbackFailure;
use crate::DatastoreKind;
use crate::Error;
use crate::Result;

/// A subscriber that accepted the EVENT phase and must see ABORT if the
/// change is dropped afterwards.
struct Notified {
    entry: SubscriptionEntry,
    callback: ModuleChangeCallback,
    diff: Diff,
}

/// How a subscription entry can be reached from this process.
pub(crate) enum Delivery {
    Local(Callback),
    /// Unsubscribed meanwhile, or its owner is gone
    Skip,
    /// Owned by another live process
    Unreachable,
}

/// Delivers changes, RPCs and notifications to subscribers.
pub struct Dispatcher {
    namespace: String,
    pid: u32,
    main: Arc<SharedRegion>,
    tables: Arc<SubscriptionTables>,
    config: DispatchConfig,
    ext_timeout: Option<Duration>,
    /// Ext read guard kept by the running callbacks of each subscription
    in_flight: DashMap<u64, Weak<LockGuard>>,
}

impl Dispatcher {
    pub fn new(
        namespace: impl Into<String>,
        main: Arc<SharedRegion>,
        tables: Arc<SubscriptionTables>,
        config: DispatchConfig,
        lock: &LockConfig,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            pid: current_pid(),
            main,
            tables,
            config,
            ext_timeout: lock.ext_lock_timeout(),
            in_flight: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Id shared by every phase of one delivery round.
    pub fn next_request_id(&self) -> u64 {
        self.main.allocate_id()
    }

    /// Ext lock budget of a round that must finish by `deadline`.
    pub(crate) fn ext_budget(
        &self,
        deadline: &Deadline,
    ) -> Option<Duration> {
        deadline.capped(self.ext_timeout)
    }

    /// Guard a callback thread of subscription `id` keeps while it runs.
    ///
    /// Callbacks of one subscription share the guard of the oldest one
    /// still running, so abandoned callbacks pin at most one reader slot
    /// per subscription instead of one per round.
    pub(crate) fn delivery_guard(
        &self,
        id: u64,
        snapshot: &Arc<LockGuard>,
    ) -> Arc<LockGuard> {
        self.in_flight.retain(|_, guard| guard.strong_count() > 0);
        let mut pinned = self.in_flight.entry(id).or_default();
        if let Some(guard) = pinned.upgrade() {
            return guard;
        }
        *pinned = Arc::downgrade(snapshot);
        snapshot.clone()
    }

    /// Delivers one phase of a change to the module-change subscribers of
    /// `datastore`, using the configured budgets.
    ///
    /// Only a failing EVENT phase returns an error; already notified
    /// subscribers receive ABORT first. DONE and ABORT failures are logged.
    pub fn notify(
        &self,
        datastore: DatastoreKind,
        diff: &Diff,
        phase: Phase,
    ) -> Result<()> {
        let request_id = self.next_request_id();
        match phase {
            Phase::Event => self
                .notify_event(datastore, diff, request_id, &Deadline::never())
                .map(|_| ()),
            Phase::Done | Phase::Abort => {
                self.notify_final(datastore, diff, phase, request_id, self.config.done_timeout());
                Ok(())
            }
        }
    }

    /// EVENT, then `commit`, then DONE. If `commit` fails, the subscribers
    /// that accepted the change receive ABORT.
    ///
    /// Each EVENT callback gets the configured callback budget, cut short
    /// by `deadline`.
    pub fn run_commit<R>(
        &self,
        datastore: DatastoreKind,
        diff: &Diff,
        deadline: &Deadline,
        commit: impl FnOnce() -> Result<R>,
    ) -> Result<R> {
        let request_id = self.next_request_id();
        let notified = self.notify_event(datastore, diff, request_id, deadline)?;

        match commit() {
            Ok(committed) => {
                self.notify_final(datastore, diff, Phase::Done, request_id, self.config.done_timeout());
                Ok(committed)
            }
            Err(e) => {
                warn!(%datastore, request_id, error = %e, "Commit failed after EVENT phase");
                self.abort(datastore, request_id, notified);
                Err(e)
            }
        }
    }

    fn notify_event(
        &self,
        datastore: DatastoreKind,
        diff: &Diff,
        request_id: u64,
        deadline: &Deadline,
    ) -> Result<Vec<Notified>> {
        let holder = HolderId::for_request(request_id);
        let mut notified: Vec<Notified> = Vec::new();

        for module in diff.modules() {
            let Some(table) = self.tables.existing_table(&module)? else {
                continue;
            };
            let snapshot = match table.enumerate(holder, self.ext_budget(deadline), |e| {
                change_subscriber(e, datastore) && !e.options.done_only
            }) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.abort(datastore, request_id, notified);
                    return Err(e);
                }
            };

            let mut stale = Vec::new();
            for entry in snapshot.entries {
                let filtered = diff.filter(&entry.xpath);
                if filtered.is_empty() {
                    continue;
                }
                let budget = deadline.slice(self.config.callback_timeout());
                let outcome = match self.resolve(&entry, &mut stale) {
                    Delivery::Local(Callback::ModuleChange(callback)) => {
                        let guard = self.delivery_guard(entry.id, &snapshot.guard);
                        let outcome = self.deliver(
                            &entry,
                            &callback,
                            Some(guard),
                            datastore,
                            filtered.clone(),
                            Phase::Event,
                            request_id,
                            budget,
                        );
                        outcome.map(|()| callback)
                    }
                    Delivery::Local(_) | Delivery::Skip => continue,
                    Delivery::Unreachable => {
                        warn!(
                            subscription_id = entry.id,
                            owner_pid = entry.owner_pid,
                            request_id,
                            "Change subscriber in another process cannot be reached"
                        );
                        self.abort(datastore, request_id, notified);
                        return Err(Error::Unreachable {
                            subscription_id: entry.id,
                            owner_pid: entry.owner_pid,
                        });
                    }
                };
                let failure = match outcome {
                    CallbackOutcome::Completed(callback) => {
                        notified.push(Notified {
                            entry,
                            callback,
                            diff: filtered,
                        });
                        continue;
                    }
                    CallbackOutcome::TimedOut => {
                        warn!(subscription_id = entry.id, ?budget, request_id, "Change callback timed out");
                        Error::CallbackTimedOut {
                            subscription_id: entry.id,
                            budget,
                        }
                    }
                    CallbackOutcome::Failed(error) => {
                        warn!(subscription_id = entry.id, %error, request_id, "Change callback rejected the change");
                        CallbackFailure {
                            subscription_id: entry.id,
                            error,
                        }
                        .into_error()
                    }
                };

                self.abort(datastore, request_id, notified);
                return Err(failure);
            }

            drop(snapshot.guard);
            self.purge_stale(&table, stale);
        }

        Ok(notified)
    }

    fn notify_final(
        &self,
        datastore: DatastoreKind,
        diff: &Diff,
        phase: Phase,
        request_id: u64,
        budget: Duration,
    ) {
        let holder = HolderId::for_request(request_id);

        for module in diff.modules() {
            let table = match self.tables.existing_table(&module) {
                Ok(Some(table)) => table,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%module, ?phase, error = %e, "Could not open subscription table");
                    continue;
                }
            };
            let snapshot = match table.enumerate(holder, self.ext_timeout, |e| change_subscriber(e, datastore)) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(%module, ?phase, error = %e, "Could not enumerate subscribers");
                    continue;
                }
            };

            let mut stale = Vec::new();
            for entry in snapshot.entries {
                let filtered = diff.filter(&entry.xpath);
                if filtered.is_empty() {
                    continue;
                }
                let Delivery::Local(Callback::ModuleChange(callback)) = self.resolve(&entry, &mut stale) else {
                    continue;
                };
                let outcome = self.deliver(
                    &entry,
                    &callback,
                    Some(self.delivery_guard(entry.id, &snapshot.guard)),
                    datastore,
                    filtered,
                    phase,
                    request_id,
                    budget,
                );
                log_final_outcome(&entry, phase, outcome);
            }

            drop(snapshot.guard);
            self.purge_stale(&table, stale);
        }
    }

    fn abort(
        &self,
        datastore: DatastoreKind,
        request_id: u64,
        notified: Vec<Notified>,
    ) {
        for done in notified.into_iter().rev() {
            let outcome = self.deliver(
                &done.entry,
                &done.callback,
                None,
                datastore,
                done.diff,
                Phase::Abort,
                request_id,
                self.config.done_timeout(),
            );
            log_final_outcome(&done.entry, Phase::Abort, outcome);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        entry: &SubscriptionEntry,
        callback: &ModuleChangeCallback,
        ext_guard: Option<Arc<LockGuard>>,
        datastore: DatastoreKind,
        diff: Diff,
        phase: Phase,
        request_id: u64,
        budget: Duration,
    ) -> CallbackOutcome<()> {
        trace!(subscription_id = entry.id, ?phase, changes = diff.len(), "Delivering change");
        if budget.is_zero() {
            return CallbackOutcome::TimedOut;
        }
        let event = ChangeEvent {
            subscription_id: entry.id,
            request_id,
            module: entry.module.clone(),
            datastore,
            phase,
            diff,
            deadline: Deadline::after(Some(budget)),
        };
        let callback = callback.clone();
        invoke_with_deadline(&format!("dstore-change-{}", entry.id), Some(budget), move || {
            let _ext_guard = ext_guard;
            callback(&event)
        })
    }

    /// How to reach `entry`. Entries of dead owners are queued in `stale`
    /// for removal.
    pub(crate) fn resolve(
        &self,
        entry: &SubscriptionEntry,
        stale: &mut Vec<u64>,
    ) -> Delivery {
        if let Some(callback) = lookup_callback(&self.namespace, entry.id) {
            return Delivery::Local(callback);
        }
        if entry.owner_pid == self.pid {
            trace!(subscription_id = entry.id, "Subscription unsubscribed during delivery");
            Delivery::Skip
        } else if !process_alive(entry.owner_pid) {
            stale.push(entry.id);
            Delivery::Skip
        } else {
            Delivery::Unreachable
        }
    }

    /// Best effort: an abandoned callback may still hold the Ext lock.
    pub(crate) fn purge_stale(
        &self,
        table: &SubscriptionTable,
        stale: Vec<u64>,
    ) {
        if stale.is_empty() {
            return;
        }
        let holder = HolderId::for_request(self.next_request_id());
        match table.purge_dead(holder, Some(Duration::ZERO)) {
            Ok(purged) => debug!(module = table.module(), purged = purged.len(), "Purged stale subscriptions"),
            Err(e) => debug!(module = table.module(), error = %e, "Deferred purge of stale subscriptions"),
        }
    }

    /// Sends an RPC to every matching subscriber in priority order and
    /// merges their outputs. The first failure aborts the call.
    pub fn send_rpc(
        &self,
        path: &XPath,
        input: DataTree,
        timeout: Duration,
    ) -> Result<DataTree> {
        let module = path
            .module()
            .ok_or_else(|| Error::InvalidArgument(format!("rpc path {path} names no module")))?;
        let deadline = Deadline::from_timeout(timeout);
        let request_id = self.next_request_id();
        let holder = HolderId::for_request(request_id);

        let Some(table) = self.tables.existing_table(module)? else {
            return Err(Error::NotFound(format!("no subscriber for rpc {path}")));
        };
        let snapshot = table.enumerate(holder, self.ext_budget(&deadline), |e| {
            e.kind == SubscriptionKind::Rpc && e.is_active() && e.xpath.covers_path(path)
        })?;

        let mut stale = Vec::new();
        let mut handlers: Vec<(SubscriptionEntry, Callback)> = Vec::new();
        for entry in snapshot.entries {
            match self.resolve(&entry, &mut stale) {
                Delivery::Local(callback) => handlers.push((entry, callback)),
                Delivery::Skip => {}
                Delivery::Unreachable => {
                    warn!(subscription_id = entry.id, owner_pid = entry.owner_pid, %path, "RPC handler in another process cannot be reached");
                    return Err(Error::Unreachable {
                        subscription_id: entry.id,
                        owner_pid: entry.owner_pid,
                    });
                }
            }
        }
        if handlers.is_empty() {
            drop(snapshot.guard);
            self.purge_stale(&table, stale);
            return Err(Error::NotFound(format!("no subscriber for rpc {path}")));
        }

        let mut output = DataTree::new();
        for (entry, callback) in handlers {
            let Callback::Rpc(callback) = callback else {
                continue;
            };
            let budget = deadline.slice(self.config.rpc_timeout());
            let request = RpcRequest {
                subscription_id: entry.id,
                request_id,
                path: path.clone(),
                input: input.clone(),
                deadline: Deadline::after(Some(budget)),
            };
            let guard = self.delivery_guard(entry.id, &snapshot.guard);
            let outcome = invoke_with_deadline(&format!("dstore-rpc-{}", entry.id), Some(budget), move || {
                let _ext_guard = guard;
                callback(&request)
            });
            match outcome {
                CallbackOutcome::Completed(part) => output.merge_tree(&part),
                CallbackOutcome::TimedOut => {
                    warn!(subscription_id = entry.id, %path, ?budget, "RPC callback timed out");
                    return Err(Error::CallbackTimedOut {
                        subscription_id: entry.id,
                        budget,
                    });
                }
                CallbackOutcome::Failed(error) => {
                    warn!(subscription_id = entry.id, %path, %error, "RPC callback failed");
                    return Err(CallbackFailure {
                        subscription_id: entry.id,
                        error,
                    }
                    .into_error());
                }
            }
        }

        drop(snapshot.guard);
        self.purge_stale(&table, stale);
        Ok(output)
    }

    /// Best-effort fan-out; returns how many subscribers accepted it.
    pub fn send_notification(
        &self,
        path: &XPath,
        content: DataTree,
    ) -> Result<usize> {
        let module = path
            .module()
            .ok_or_else(|| Error::InvalidArgument(format!("notification path {path} names no module")))?;
        let Some(table) = self.tables.existing_table(module)? else {
            return Ok(0);
        };
        let request_id = self.next_request_id();
        let snapshot = table.enumerate(HolderId::for_request(request_id), self.ext_timeout, |e| {
            e.kind == SubscriptionKind::Notification && e.is_active() && e.xpath.intersects(path)
        })?;

        let timestamp_ms = timestamp_millis();
        let budget = self.config.notification_timeout();
        let mut stale = Vec::new();
        let mut delivered = 0;
        for entry in snapshot.entries {
            let callback = match self.resolve(&entry, &mut stale) {
                Delivery::Local(Callback::Notification(callback)) => callback,
                Delivery::Unreachable => {
                    warn!(subscription_id = entry.id, owner_pid = entry.owner_pid, %path, "Notification subscriber in another process cannot be reached");
                    continue;
                }
                _ => continue,
            };
            let event = NotificationEvent {
                subscription_id: entry.id,
                path: path.clone(),
                content: content.clone(),
                timestamp_ms,
            };
            let guard = self.delivery_guard(entry.id, &snapshot.guard);
            let outcome = invoke_with_deadline(&format!("dstore-notif-{}", entry.id), Some(budget), move || {
                let _ext_guard = guard;
                callback(&event)
            });
            match outcome {
                CallbackOutcome::Completed(()) => delivered += 1,
                CallbackOutcome::TimedOut => {
                    warn!(subscription_id = entry.id, %path, ?budget, "Notification callback timed out")
                }
                CallbackOutcome::Failed(error) => {
                    warn!(subscription_id = entry.id, %path, %error, "Notification callback failed")
                }
            }
        }

        drop(snapshot.guard);
        self.purge_stale(&table, stale);
        Ok(delivered)
    }
}

fn change_subscriber(
    entry: &SubscriptionEntry,
    datastore: DatastoreKind,
) -> bool {
    entry.kind == SubscriptionKind::ModuleChange && entry.datastore == datastore && entry.is_active()
}

fn log_final_outcome(
    entry: &SubscriptionEntry,
    phase: Phase,
    outcome: CallbackOutcome<()>,
) {
    match outcome {
        CallbackOutcome::Completed(()) => {}
        CallbackOutcome::TimedOut => warn!(subscription_id = entry.id, ?phase, "Change callback timed out"),
        CallbackOutcome::Failed(error) => {
            warn!(subscription_id = entry.id, ?phase, %error, "Change callback failed")
        }
    }
}
