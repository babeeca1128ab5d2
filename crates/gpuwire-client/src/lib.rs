//! Client half of the GPU command wire.
//!
//! [`WireClient`] owns the outgoing command serializer, the incoming return
//! reassembler, the per-type proxy tables and the future manager. Proxy
//! objects ([`Device`], [`Buffer`], [`Texture`], [`Queue`]) are thin handles
//! that route every call back through the shared client state.

mod client;
mod events;

pub use client::{Buffer, Device, Queue, Texture, WireClient};
pub use events::{
    CallbackMode, CompleteReason, DeviceLostInfo, ManagerState, MapBufferResult,
    RequestDeviceResult, WaitEntry, WaitStatus,
};
