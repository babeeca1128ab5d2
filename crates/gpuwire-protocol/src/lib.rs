//! `gpuwire-protocol` defines the wire format shared by the client and
//! server halves of the GPU command-wire layer.
//!
//! This crate provides:
//! - Wire object identity (`ObjectHandle`, id + generation) and the
//!   per-object-type slot table (see [`ObjectTable`]).
//! - The framed command records exchanged between client and server
//!   (see [`cmd`]).
//! - Chunked framing for commands that exceed a single transport write
//!   (see [`CommandReassembler`] and [`ChunkedCommandSerializer`]).

mod chunk;
mod codec;
mod error;
mod handle;
mod table;

pub mod cmd;

pub use chunk::{
    ChunkedCommandSerializer, CommandReassembler, CommandSink, NullSink, VecSink, EXT_ALIGN,
};
pub use codec::{CmdReader, CmdWriter};
pub use error::WireError;
pub use handle::{ObjectHandle, ObjectType, NULL_OBJECT_ID};
pub use table::{ObjectTable, SlotState};
