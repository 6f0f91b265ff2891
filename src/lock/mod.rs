//! Cross-process bounded reader/writer lock.
//!
//! Lock state lives entirely in the holder slots of a shared region: a slot
//! with a non-zero pid is held, nothing else is. Any process can therefore
//! inspect and repair a lock left behind by a crashed peer.

mod holder;
mod rwlock;


pub(crate) use holder::HolderSlot;
pub use holder::HolderId;
pub use holder::HolderRecord;
pub use holder::LockMode;
pub use rwlock::*;
