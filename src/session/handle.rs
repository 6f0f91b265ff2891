use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::ConnectionInner;
use crate::lock::HolderId;
use crate::subscription::SubscriptionKind;
use crate::subscription::SubscriptionState;
use crate::utils::time::optional_timeout;
use crate::Error;
use crate::Result;

/// Handle of a registered subscription.
///
/// Dropping the handle keeps the subscription; it lives until
/// [`Subscription::unsubscribe`] or until its connection disconnects.
pub struct Subscription {
    conn: Arc<ConnectionInner>,
    module: String,
    id: u64,
    kind: SubscriptionKind,
}

impl std::fmt::Debug for Subscription {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("module", &self.module)
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(
        conn: Arc<ConnectionInner>,
        module: &str,
        id: u64,
        kind: SubscriptionKind,
    ) -> Self {
        Self {
            conn,
            module: module.to_string(),
            id,
            kind,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    /// Removes the subscription. `Duration::ZERO` waits indefinitely.
    ///
    /// Times out while a delivery round of this module is still running,
    /// e.g. an abandoned callback; calling again later succeeds, also when
    /// an earlier call already removed it.
    pub fn unsubscribe(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        self.conn
            .unsubscribe(&self.module, self.id, optional_timeout(timeout))
    }

    /// Stops deliveries without removing the subscription.
    pub fn suspend(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        self.set_state(SubscriptionState::Suspended, timeout)
    }

    pub fn resume(
        &self,
        timeout: Duration,
    ) -> Result<()> {
        self.set_state(SubscriptionState::Active, timeout)
    }

    fn set_state(
        &self,
        state: SubscriptionState,
        timeout: Duration,
    ) -> Result<()> {
        let table = self.conn.tables.table(&self.module)?;
        let found = table.set_state(
            self.id,
            state,
            HolderId::for_session(self.conn.id),
            optional_timeout(timeout),
        )?;
        if !found {
            return Err(Error::NotFound(format!("subscription {}", self.id)));
        }
        debug!(subscription_id = self.id, ?state, "Subscription state set");
        Ok(())
    }
}
