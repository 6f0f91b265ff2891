use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;
use tracing::warn;

use super::OperState;
use crate::config::OperConfig;
use crate::lock::HolderId;
use crate::notify::invoke_with_deadline;
use crate::notify::CallbackOutcome;
use crate::notify::Delivery;
use crate::notify::Dispatcher;
use crate::notify::OperGetRequest;
use crate::subscription::Callback;
use crate::subscription::SubscriptionEntry;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionTables;
use crate::tree::DataTree;
use crate::tree::XPath;
use crate::utils::time::Deadline;
use crate::CallbackFailure;
use crate::DatastoreKind;
use crate::Datastores;
use crate::Error;
use crate::Result;

/// Which layers an operational read skips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetFlags {
    /// Skip the running configuration as base
    pub no_config: bool,
    /// Skip the edit layers pushed by sessions
    pub no_stored: bool,
    /// Skip the pull providers
    pub no_subscriptions: bool,
}

/// Provider data kept for a poll subscription.
struct Polled {
    fragment: DataTree,
    fetched_at: Instant,
}

/// Builds the operational view: running base, pushed edit layers, then
/// data pulled from providers.
pub struct OverlayEngine {
    datastores: Arc<Datastores>,
    tables: Arc<SubscriptionTables>,
    dispatcher: Arc<Dispatcher>,
    config: OperConfig,
    /// Keyed by the id of the polled provider
    poll_cache: DashMap<u64, Polled>,
}

impl OverlayEngine {
    pub fn new(
        datastores: Arc<Datastores>,
        tables: Arc<SubscriptionTables>,
        dispatcher: Arc<Dispatcher>,
        config: OperConfig,
    ) -> Self {
        Self {
            datastores,
            tables,
            dispatcher,
            config,
            poll_cache: DashMap::new(),
        }
    }

    /// Operational data selected by `query`, as an owned tree.
    ///
    /// The operational read lock is held for the whole call, so every
    /// layer is read from one consistent snapshot. Late or failing
    /// providers are left out unless registered as mandatory.
    pub fn get_data(
        &self,
        query: &XPath,
        max_depth: u32,
        deadline: &Deadline,
        flags: GetFlags,
        holder: HolderId,
    ) -> Result<DataTree> {
        let oper = self.datastores.operational().read(holder, deadline.remaining())?;

        let mut tree = if flags.no_config {
            DataTree::new()
        } else {
            self.running_base(query, holder, deadline)?
        };
        if !flags.no_stored {
            oper.value().apply(&mut tree, query)?;
        }
        if !flags.no_subscriptions {
            self.pull(query, deadline, &mut tree)?;
        }

        drop(oper);
        Ok(tree.select(query, max_depth))
    }

    /// Running base plus every edit layer, without providers. Used to diff
    /// operational writes.
    pub fn stored_view(
        running: &DataTree,
        state: &OperState,
    ) -> Result<DataTree> {
        let mut tree = running.clone();
        state.apply(&mut tree, &XPath::root())?;
        Ok(tree)
    }

    fn running_base(
        &self,
        query: &XPath,
        holder: HolderId,
        deadline: &Deadline,
    ) -> Result<DataTree> {
        let running = self
            .datastores
            .read_config(DatastoreKind::Running, holder, deadline)?;
        Ok(running.select(query, 0))
    }

    fn pull(
        &self,
        query: &XPath,
        deadline: &Deadline,
        tree: &mut DataTree,
    ) -> Result<()> {
        let modules = match query.module() {
            Some(module) => vec![module.to_string()],
            None => self.tables.known_modules()?,
        };

        for module in modules {
            let Some(table) = self.tables.existing_table(&module)? else {
                continue;
            };
            let request_id = self.dispatcher.next_request_id();
            let snapshot = match table.enumerate(
                HolderId::for_request(request_id),
                self.dispatcher.ext_budget(deadline),
                |e| is_pull_entry(e) && e.is_active() && e.xpath.intersects(query),
            ) {
                Ok(snapshot) => snapshot,
                Err(e) if e.is_timeout() => {
                    warn!(%module, error = %e, "Subscription table busy, leaving out its providers");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut stale = Vec::new();
            for entry in &snapshot.entries {
                if entry.kind != SubscriptionKind::OperGet {
                    continue;
                }
                let validity = poll_validity(&snapshot.entries, entry);
                if validity.is_none() {
                    self.poll_cache.remove(&entry.id);
                }
                if let Some(cached) = validity.and_then(|valid| self.cached(entry.id, valid)) {
                    debug!(subscription_id = entry.id, "Served provider data from poll cache");
                    tree.merge_tree(&cached);
                    continue;
                }

                let callback = match self.dispatcher.resolve(entry, &mut stale) {
                    Delivery::Local(Callback::OperGet(callback)) => callback,
                    Delivery::Unreachable if entry.options.mandatory => {
                        warn!(subscription_id = entry.id, owner_pid = entry.owner_pid, "Mandatory provider cannot be reached");
                        return Err(Error::Unreachable {
                            subscription_id: entry.id,
                            owner_pid: entry.owner_pid,
                        });
                    }
                    Delivery::Unreachable => {
                        debug!(subscription_id = entry.id, owner_pid = entry.owner_pid, "Provider in another process left out");
                        continue;
                    }
                    _ => continue,
                };

                let budget = deadline.slice(self.config.pull_timeout());
                let request = OperGetRequest {
                    subscription_id: entry.id,
                    request_id,
                    module: module.clone(),
                    xpath: entry.xpath.clone(),
                    // polled data is cached whole, not only the queried part
                    query: if validity.is_some() {
                        entry.xpath.clone()
                    } else {
                        query.clone()
                    },
                    deadline: Deadline::after(Some(budget)),
                };
                let guard = self.dispatcher.delivery_guard(entry.id, &snapshot.guard);
                let outcome = if budget.is_zero() {
                    CallbackOutcome::TimedOut
                } else {
                    invoke_with_deadline(&format!("dstore-pull-{}", entry.id), Some(budget), move || {
                        let _ext_guard = guard;
                        callback(&request)
                    })
                };

                match outcome {
                    CallbackOutcome::Completed(fragment) => {
                        let owned = fragment.select(&entry.xpath, 0);
                        debug!(subscription_id = entry.id, nodes = owned.len(), "Merged pulled data");
                        tree.merge_tree(&owned);
                        if validity.is_some() {
                            self.poll_cache.insert(
                                entry.id,
                                Polled {
                                    fragment: owned,
                                    fetched_at: Instant::now(),
                                },
                            );
                        }
                    }
                    CallbackOutcome::TimedOut => {
                        warn!(subscription_id = entry.id, xpath = %entry.xpath, ?budget, "Abandoned late pull provider");
                        if entry.options.mandatory {
                            return Err(Error::CallbackTimedOut {
                                subscription_id: entry.id,
                                budget,
                            });
                        }
                    }
                    CallbackOutcome::Failed(error) => {
                        warn!(subscription_id = entry.id, xpath = %entry.xpath, %error, "Pull provider failed");
                        if entry.options.mandatory {
                            return Err(CallbackFailure {
                                subscription_id: entry.id,
                                error,
                            }
                            .into_error());
                        }
                    }
                }
            }

            drop(snapshot.guard);
            self.dispatcher.purge_stale(&table, stale);
        }
        Ok(())
    }

    /// Cached data of provider `id` if fetched less than `valid` ago.
    fn cached(
        &self,
        id: u64,
        valid: Duration,
    ) -> Option<DataTree> {
        let polled = self.poll_cache.get(&id)?;
        (polled.fetched_at.elapsed() < valid).then(|| polled.fragment.clone())
    }
}

fn is_pull_entry(entry: &SubscriptionEntry) -> bool {
    matches!(entry.kind, SubscriptionKind::OperGet | SubscriptionKind::OperPoll)
}

/// Longest validity among the poll subscriptions of `provider`'s xpath.
fn poll_validity(
    entries: &[SubscriptionEntry],
    provider: &SubscriptionEntry,
) -> Option<Duration> {
    entries
        .iter()
        .filter(|e| e.kind == SubscriptionKind::OperPoll && e.xpath == provider.xpath)
        .map(|e| Duration::from_millis(e.options.poll_valid_ms))
        .max()
}
