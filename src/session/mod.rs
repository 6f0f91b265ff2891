//! Connections, sessions and subscription handles.

mod connection;
mod edit;
mod handle;
mod session;


pub use connection::*;
pub use edit::EditOptions;
pub use handle::*;
pub use session::*;
