//! Delivery of changes, RPCs and notifications to subscriber callbacks.
//!
//! Every piece of user code runs on its own thread under a budget; a late
//! callback is abandoned, never waited for past its budget.

mod dispatcher;
mod events;
mod invoke;

#[cfg(test)]
mod dispatcher_test;

pub use dispatcher::*;
pub use events::*;
pub use invoke::*;
