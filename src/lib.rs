//! Umbrella crate re-exporting the GPU command-wire stack.
//!
//! Most embedders depend on the individual crates directly; this package
//! exists primarily to host the cross-crate integration tests under
//! `tests/`, which wire a [`gpuwire_client::WireClient`] to a
//! [`gpuwire_server::WireServer`] through an in-memory transport.

pub use gpuwire_client as client;
pub use gpuwire_protocol as protocol;
pub use gpuwire_server as server;
