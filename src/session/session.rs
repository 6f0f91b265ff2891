use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

use super::edit::edits_from_tree;
use super::edit::PendingEdit;
use super::ConnectionInner;
use super::EditOptions;
use super::Subscription;
use crate::lock::HolderId;
use crate::notify::invoke_with_deadline;
use crate::notify::CallbackOutcome;
use crate::notify::ChangeEvent;
use crate::notify::NotificationEvent;
use crate::notify::OperGetRequest;
use crate::notify::Phase;
use crate::notify::RpcRequest;
use crate::oper::EditOperation;
use crate::oper::EditOrigin;
use crate::oper::GetFlags;
use crate::subscription::register_callback;
use crate::subscription::remove_callback;
use crate::subscription::Callback;
use crate::subscription::SubscribeOptions;
use crate::subscription::SubscriptionEntry;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionState;
use crate::tree::DataTree;
use crate::tree::Diff;
use crate::tree::XPath;
use crate::utils::time::Deadline;
use crate::CallbackError;
use crate::CallbackFailure;
use crate::DatastoreKind;
use crate::Error;
use crate::Result;

/// Unit of work bound to one datastore.
///
/// Edits are buffered in the session and invisible to everyone, this
/// session's reads included, until [`Session::apply_changes`].
pub struct Session {
    conn: Arc<ConnectionInner>,
    id: u64,
    datastore: DatastoreKind,
    edits: Vec<PendingEdit>,
    /// Whether this session may own an operational edit layer
    pushed_oper: bool,
    stopped: bool,
}

impl Session {
    pub(crate) fn new(
        conn: Arc<ConnectionInner>,
        id: u64,
        datastore: DatastoreKind,
    ) -> Self {
        Self {
            conn,
            id,
            datastore,
            edits: vec![],
            pushed_oper: false,
            stopped: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn datastore(&self) -> DatastoreKind {
        self.datastore
    }

    fn holder(&self) -> HolderId {
        HolderId::for_session(self.id)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.stopped {
            return Err(Error::StaleHandle(format!("session {} is stopped", self.id)));
        }
        self.conn.ensure_open()
    }

    /// Refused while edits are pending.
    pub fn switch_datastore(
        &mut self,
        datastore: DatastoreKind,
    ) -> Result<()> {
        if !self.edits.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "session {} has {} pending edits on {}",
                self.id,
                self.edits.len(),
                self.datastore
            )));
        }
        self.datastore = datastore;
        Ok(())
    }

    /// Buffers a merge of `value` at `path`, or a create when strict.
    pub fn set_item(
        &mut self,
        path: &str,
        value: Option<&str>,
        options: EditOptions,
    ) -> Result<()> {
        self.ensure_usable()?;
        let operation = if options.strict {
            EditOperation::Create
        } else {
            EditOperation::Merge
        };
        let strict = options.strict && self.datastore.is_config();
        self.edits.push(PendingEdit::new(
            operation,
            XPath::parse(path)?,
            value.map(str::to_string),
            strict,
        )?);
        Ok(())
    }

    /// Buffers removal of every subtree selected by `path`.
    pub fn delete_item(
        &mut self,
        path: &str,
        options: EditOptions,
    ) -> Result<()> {
        self.ensure_usable()?;
        let strict = options.strict && self.datastore.is_config();
        self.edits
            .push(PendingEdit::new(EditOperation::Remove, XPath::parse(path)?, None, strict)?);
        Ok(())
    }

    /// Hides data under `path` from the operational view, including data
    /// coming from running.
    pub fn discard_items(
        &mut self,
        path: &str,
    ) -> Result<()> {
        if self.datastore != DatastoreKind::Operational {
            return Err(Error::InvalidArgument(
                "discard_items is only valid on the operational datastore".to_string(),
            ));
        }
        self.delete_item(path, EditOptions::default())
    }

    /// Buffers `operation` for every terminal node of `tree`.
    pub fn edit_batch(
        &mut self,
        tree: &DataTree,
        operation: EditOperation,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.edits.extend(edits_from_tree(tree, operation, false)?);
        Ok(())
    }

    pub fn discard_changes(&mut self) {
        self.edits.clear();
    }

    pub fn has_changes(&self) -> bool {
        !self.edits.is_empty()
    }

    /// Validates, notifies and commits the pending edits.
    ///
    /// `timeout` bounds the whole call, lock waits and callbacks included;
    /// each callback also stays within the configured callback budget.
    /// `Duration::ZERO` blocks on the locks. On error the datastore is
    /// unchanged and the edits stay pending.
    pub fn apply_changes(
        &mut self,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_usable()?;
        if self.edits.is_empty() {
            return Ok(());
        }

        let deadline = Deadline::from_timeout(timeout);
        let holder = self.holder();
        let edits = &self.edits;

        match self.datastore {
            DatastoreKind::Operational => {
                self.pushed_oper = true;
                let origin = EditOrigin {
                    pid: self.conn.pid,
                    connection_id: self.conn.id,
                    session_id: self.id,
                };
                self.conn.commit_oper(holder, &deadline, |state| {
                    let layer = state.layer_mut(origin);
                    for edit in edits {
                        layer.push(edit.to_oper_edit())?;
                    }
                    Ok(())
                })?;
            }
            datastore => {
                self.conn
                    .commit_config(datastore, holder, &deadline, |current| {
                        let mut next = current.clone();
                        for edit in edits {
                            edit.apply_config(&mut next)?;
                        }
                        Ok(next)
                    })?;
            }
        }

        self.edits.clear();
        Ok(())
    }

    /// Data selected by `xpath`, as an owned tree. `max_depth` 0 is
    /// unlimited; `flags` only affect the operational datastore.
    pub fn get_data(
        &self,
        xpath: &str,
        max_depth: u32,
        timeout: Duration,
        flags: GetFlags,
    ) -> Result<DataTree> {
        self.ensure_usable()?;
        let query = XPath::parse(xpath)?;
        let deadline = Deadline::from_timeout(timeout);

        match self.datastore {
            DatastoreKind::Operational => {
                self.conn
                    .overlay
                    .get_data(&query, max_depth, &deadline, flags, self.holder())
            }
            datastore => Ok(self
                .conn
                .datastores
                .read_config(datastore, self.holder(), &deadline)?
                .select(&query, max_depth)),
        }
    }

    /// Replaces this session's datastore with the content of `source`.
    pub fn copy_config(
        &mut self,
        source: DatastoreKind,
        timeout: Duration,
    ) -> Result<()> {
        self.ensure_usable()?;
        if !source.is_config() || !self.datastore.is_config() || source == self.datastore {
            return Err(Error::InvalidArgument(format!(
                "cannot copy {source} into {}",
                self.datastore
            )));
        }

        let deadline = Deadline::from_timeout(timeout);
        let content = self
            .conn
            .datastores
            .read_config(source, self.holder(), &deadline)?;
        self.conn.commit_config(
            self.datastore,
            self.holder(),
            &deadline,
            |_| Ok((*content).clone()),
        )?;
        Ok(())
    }

    /// Subscribes to changes of `module` in this session's datastore,
    /// optionally restricted to `xpath`.
    pub fn subscribe_module_change<F>(
        &self,
        module: &str,
        xpath: Option<&str>,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&ChangeEvent) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        let xpath = module_xpath(module, xpath)?;
        self.subscribe(
            module,
            xpath,
            SubscriptionKind::ModuleChange,
            self.datastore,
            options,
            Some(Callback::ModuleChange(Arc::new(callback))),
        )
    }

    /// Registers a pull provider of operational data under `xpath`.
    pub fn subscribe_oper_get<F>(
        &self,
        module: &str,
        xpath: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&OperGetRequest) -> std::result::Result<DataTree, CallbackError> + Send + Sync + 'static,
    {
        let xpath = module_xpath(module, Some(xpath))?;
        self.subscribe(
            module,
            xpath,
            SubscriptionKind::OperGet,
            DatastoreKind::Operational,
            options,
            Some(Callback::OperGet(Arc::new(callback))),
        )
    }

    /// Caches the data of the pull provider registered for `xpath`, so
    /// operational reads within `valid` of the last pull reuse it instead of
    /// calling the provider again.
    pub fn subscribe_oper_poll(
        &self,
        module: &str,
        xpath: &str,
        valid: Duration,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        if valid.is_zero() {
            return Err(Error::InvalidArgument("poll validity must not be zero".to_string()));
        }
        let xpath = module_xpath(module, Some(xpath))?;
        let options = SubscribeOptions {
            poll_valid_ms: valid.as_millis() as u64,
            ..options
        };
        self.subscribe(
            module,
            xpath,
            SubscriptionKind::OperPoll,
            DatastoreKind::Operational,
            options,
            None,
        )
    }

    /// Handles the RPC or action at `path`.
    pub fn subscribe_rpc<F>(
        &self,
        path: &str,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&RpcRequest) -> std::result::Result<DataTree, CallbackError> + Send + Sync + 'static,
    {
        let xpath = XPath::parse(path)?;
        let module = xpath
            .module()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidArgument(format!("rpc path {path} names no module")))?;
        self.subscribe(
            &module,
            xpath,
            SubscriptionKind::Rpc,
            DatastoreKind::Running,
            options,
            Some(Callback::Rpc(Arc::new(callback))),
        )
    }

    pub fn subscribe_notification<F>(
        &self,
        module: &str,
        xpath: Option<&str>,
        callback: F,
    ) -> Result<Subscription>
    where
        F: Fn(&NotificationEvent) -> std::result::Result<(), CallbackError> + Send + Sync + 'static,
    {
        let xpath = module_xpath(module, xpath)?;
        self.subscribe(
            module,
            xpath,
            SubscriptionKind::Notification,
            DatastoreKind::Running,
            SubscribeOptions::default(),
            Some(Callback::Notification(Arc::new(callback))),
        )
    }

    /// Calls the RPC handlers of `path` and returns their merged output.
    pub fn send_rpc(
        &self,
        path: &str,
        input: DataTree,
        timeout: Duration,
    ) -> Result<DataTree> {
        self.ensure_usable()?;
        self.conn
            .dispatcher
            .send_rpc(&XPath::parse(path)?, input, timeout)
    }

    /// Returns how many subscribers accepted the notification.
    pub fn send_notification(
        &self,
        path: &str,
        content: DataTree,
    ) -> Result<usize> {
        self.ensure_usable()?;
        self.conn
            .dispatcher
            .send_notification(&XPath::parse(path)?, content)
    }

    /// Ends the session and drops the operational data it pushed.
    pub fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    pub(super) fn stop_inner(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.edits.clear();
        debug!(session_id = self.id, "Session stopped");

        if !self.pushed_oper || self.conn.is_closed() {
            return Ok(());
        }
        let deadline = Deadline::after(self.conn.ext_timeout());
        let session_id = self.id;
        self.conn.commit_oper(self.holder(), &deadline, |state| {
            state.remove_layer(session_id);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        module: &str,
        xpath: XPath,
        kind: SubscriptionKind,
        datastore: DatastoreKind,
        options: SubscribeOptions,
        callback: Option<Callback>,
    ) -> Result<Subscription> {
        self.ensure_usable()?;
        let conn = &self.conn;
        let table = conn.tables.table(module)?;
        let id = conn.main.allocate_id();
        let replay = kind == SubscriptionKind::ModuleChange && options.enabled;

        let entry = SubscriptionEntry {
            id,
            module: module.to_string(),
            xpath: xpath.clone(),
            kind,
            datastore,
            options,
            owner_pid: conn.pid,
            connection_id: conn.id,
            state: if replay {
                SubscriptionState::Pending
            } else {
                SubscriptionState::Active
            },
        };

        if let Some(callback) = &callback {
            register_callback(&conn.namespace, id, callback.clone());
        }
        if let Err(e) = table.register(entry, self.holder(), conn.ext_timeout()) {
            remove_callback(&conn.namespace, id);
            return Err(e);
        }
        conn.track_subscription(module, id);
        let handle = Subscription::new(conn.clone(), module, id, kind);

        if let (true, Some(callback)) = (replay, &callback) {
            // the Ext lock is not held while user code runs
            let replayed = self
                .replay_current(id, module, &xpath, datastore, callback)
                .and_then(|_| {
                    table
                        .set_state(id, SubscriptionState::Active, self.holder(), conn.ext_timeout())
                        .map(|_| ())
                });
            if let Err(e) = replayed {
                if let Err(cleanup) = handle.unsubscribe(Duration::ZERO) {
                    warn!(subscription_id = id, error = %cleanup, "Failed to remove subscription after replay error");
                }
                return Err(e);
            }
        }

        debug!(subscription_id = id, %module, ?kind, %datastore, "Subscribed");
        Ok(handle)
    }

    /// Delivers the current data under `xpath` as a creation, EVENT then
    /// DONE.
    fn replay_current(
        &self,
        id: u64,
        module: &str,
        xpath: &XPath,
        datastore: DatastoreKind,
        callback: &Callback,
    ) -> Result<()> {
        let Callback::ModuleChange(callback) = callback else {
            return Ok(());
        };
        let dispatch = &self.conn.config.dispatch;
        let deadline = Deadline::after(Some(dispatch.callback_timeout()));

        let current = match datastore {
            DatastoreKind::Operational => {
                self.conn
                    .overlay
                    .get_data(xpath, 0, &deadline, GetFlags::default(), self.holder())?
            }
            _ => self
                .conn
                .datastores
                .read_config(datastore, self.holder(), &deadline)?
                .select(xpath, 0),
        };
        let diff = Diff::between(&DataTree::new(), &current);
        if diff.is_empty() {
            return Ok(());
        }

        let request_id = self.conn.dispatcher.next_request_id();
        for (phase, budget) in [
            (Phase::Event, dispatch.callback_timeout()),
            (Phase::Done, dispatch.done_timeout()),
        ] {
            let event = ChangeEvent {
                subscription_id: id,
                request_id,
                module: module.to_string(),
                datastore,
                phase,
                diff: diff.clone(),
                deadline: Deadline::after(Some(budget)),
            };
            let callback = callback.clone();
            let outcome = invoke_with_deadline(&format!("dstore-replay-{id}"), Some(budget), move || {
                callback(&event)
            });
            match (phase, outcome) {
                (_, CallbackOutcome::Completed(())) => {}
                (Phase::Event, CallbackOutcome::TimedOut) => {
                    return Err(Error::CallbackTimedOut {
                        subscription_id: id,
                        budget,
                    })
                }
                (Phase::Event, CallbackOutcome::Failed(error)) => {
                    return Err(CallbackFailure {
                        subscription_id: id,
                        error,
                    }
                    .into_error())
                }
                (_, outcome) => warn!(subscription_id = id, ?phase, ?outcome, "Replay DONE callback failed"),
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            warn!(session_id = self.id, error = %e, "Cleanup on drop failed");
        }
    }
}

/// Subscription xpath: `xpath` when given, checked against `module`, else
/// the whole module.
fn module_xpath(
    module: &str,
    xpath: Option<&str>,
) -> Result<XPath> {
    let Some(xpath) = xpath else {
        return Ok(XPath::parse(&format!("/{module}:*"))?);
    };
    let parsed = XPath::parse(xpath)?;
    if parsed.module() != Some(module) {
        return Err(Error::InvalidArgument(format!(
            "xpath {xpath} does not belong to module {module}"
        )));
    }
    Ok(parsed)
}
