//! Hierarchical data trees addressed by a small XPath subset.
//!
//! Nodes are keyed by name plus predicates, so list entries and leaf-list
//! instances are unique among their siblings and merging the same instance
//! twice never yields two copies.

mod diff;
mod node;
mod path;
mod validator;


pub use diff::*;
pub use node::*;
pub use path::*;
pub use validator::*;
