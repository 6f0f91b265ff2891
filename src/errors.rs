//! Datastore Error Hierarchy
//!
//! Errors are grouped by the layer that produces them: shared-memory locks,
//! on-disk snapshots, configuration, paths, schema validation and subscriber
//! callbacks. Lock and callback budget failures are always safe to retry; see
//! [`Error::is_timeout`].

use std::path::PathBuf;
use std::time::Duration;

use config::ConfigError;

use crate::lock::HolderRecord;
use crate::lock::LockMode;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shared-memory lock failures (timeouts, reentrancy, corrupted slots)
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Region mapping and snapshot persistence failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed xpath expressions
    #[error(transparent)]
    Path(#[from] PathError),

    /// Schema or type violation; the caller must fix the edit
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Subscriber reported an application failure
    #[error(transparent)]
    Callback(#[from] CallbackFailure),

    /// Subscriber did not answer within its budget
    #[error("Callback of subscription {subscription_id} timed out after {budget:?}")]
    CallbackTimedOut { subscription_id: u64, budget: Duration },

    /// Subscriber lives in another live process with no delivery path
    #[error("Subscription {subscription_id} is owned by process {owner_pid} and cannot be reached")]
    Unreachable { subscription_id: u64, owner_pid: u32 },

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Item already exists: {0}")]
    Exists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle refers to state owned by a peer that is gone
    #[error("Stale handle: {0}")]
    StaleHandle(String),

    #[error("Connection is closed")]
    Disconnected,

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Lock or callback budget exceeded. Retrying is always safe.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Lock(LockError::TimedOut { .. }) | Error::CallbackTimedOut { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Budget exhausted before the lock could be obtained
    #[error("Timed out after {waited:?} acquiring {mode:?} lock on {lock} (holders: {holders:?})")]
    TimedOut {
        lock: String,
        mode: LockMode,
        waited: Duration,
        holders: Vec<HolderRecord>,
    },

    /// The holder already owns a slot of this lock instance
    #[error("Holder {holder:#x} already holds lock {lock}")]
    Reentrant { lock: String, holder: u64 },

    /// Guard found its slot owned by someone else on release
    #[error("Lock {lock} slot {slot} corrupted: {reason}")]
    Corrupted {
        lock: String,
        slot: usize,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failures on region or snapshot files
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("Error occurred at path: {path}")]
    PathError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Serialization failures for persisted data
    #[error(transparent)]
    BincodeError(#[from] bincode::Error),

    /// Region file carries a foreign magic or an unsupported version
    #[error("Region {path} has an incompatible layout: {reason}")]
    RegionLayout { path: PathBuf, reason: String },

    #[error("Data corruption detected at {location}")]
    DataCorruption { location: String },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path must be absolute: {0}")]
    NotAbsolute(String),

    #[error("Empty path segment in {0}")]
    EmptySegment(String),

    #[error("Malformed predicate in {path}: {reason}")]
    MalformedPredicate { path: String, reason: String },

    #[error("Wildcards are not allowed in edit paths: {0}")]
    WildcardInEdit(String),

    #[error("Missing module prefix on first segment of {0}")]
    MissingModule(String),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Validation failed{}: {message}", path.as_ref().map(|p| format!(" at {p}")).unwrap_or_default())]
pub struct ValidationError {
    pub path: Option<String>,
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            path: None,
            message: message.into(),
        }
    }

    pub fn at(
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: Some(path.into()),
            message: message.into(),
        }
    }
}

/// Error returned by user callbacks.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The change violates a constraint owned by the subscriber
    #[error("validation: {0}")]
    Validation(String),

    /// Any other subscriber-side failure
    #[error("{0}")]
    Application(String),
}

/// A [`CallbackError`] attributed to the subscription that raised it.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("Subscription {subscription_id} failed: {error}")]
pub struct CallbackFailure {
    pub subscription_id: u64,
    pub error: CallbackError,
}

impl CallbackFailure {
    /// Validation failures surface as [`Error::Validation`] so callers treat
    /// them like schema violations; everything else stays a callback error.
    pub fn into_error(self) -> Error {
        match self.error {
            CallbackError::Validation(message) => Error::Validation(ValidationError {
                path: None,
                message: format!("subscription {}: {}", self.subscription_id, message),
            }),
            CallbackError::Application(_) => Error::Callback(self),
        }
    }
}
