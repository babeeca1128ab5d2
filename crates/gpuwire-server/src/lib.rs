//! Server half of the GPU command wire.
//!
//! [`WireServer`] decodes forward commands, resolves object ids against its
//! own tables, and calls into an embedder-supplied [`GpuDriver`]. Driver
//! asynchrony is token-based: the server mints a token per pending
//! operation, hands it to the driver, and matches it back up when the
//! driver reports completion through [`GpuDriver::poll_events`].

mod driver;
mod server;

pub use driver::{DriverEvent, GpuDriver};
pub use server::WireServer;
