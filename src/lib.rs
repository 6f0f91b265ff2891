//! Multi-process configuration and operational-state datastore.
//!
//! Processes on one host share datastores through memory-mapped regions
//! guarded by crash-resilient reader/writer locks. Writes are validated,
//! offered to subscribers, and committed as a whole or not at all.
//!
//! ```ignore
//! let conn = Connection::connect(DstoreConfig::new()?)?;
//! let mut session = conn.session_start(DatastoreKind::Running)?;
//! session.set_item("/car:cars/car[name='a']/speed", Some("90"), EditOptions::default())?;
//! session.apply_changes(Duration::ZERO)?;
//! ```

pub mod config;
pub mod constants;
mod datastore;
mod errors;
pub mod lock;
pub mod notify;
pub mod oper;
mod session;
pub mod shm;
pub mod subscription;
pub mod tree;
pub mod utils;

pub use config::DstoreConfig;
pub use datastore::*;
pub use errors::*;
pub use notify::ChangeEvent;
pub use notify::NotificationEvent;
pub use notify::OperGetRequest;
pub use notify::Phase;
pub use notify::RpcRequest;
pub use oper::EditOperation;
pub use oper::GetFlags;
pub use session::*;
pub use subscription::SubscribeOptions;
pub use tree::DataTree;
pub use tree::XPath;
pub use utils::time::Deadline;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
