//! Operational datastore: per-session edit layers and the overlay that
//! merges them with running data and pull providers.

mod edit_layer;
mod overlay;

#[cfg(test)]
mod edit_layer_test;

pub use edit_layer::*;
pub use overlay::*;
