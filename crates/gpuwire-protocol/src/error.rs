use thiserror::Error;

use crate::handle::ObjectType;

/// Fatal wire faults.
///
/// Any of these returned from a dispatch path means the whole connection is
/// unusable; the embedder is expected to tear the session down. Recoverable,
/// per-command failures (an unsupported feature, a failed map) never surface
/// here: they travel inside return-command payloads as a status plus a
/// human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of command payload")]
    UnexpectedEof,
    #[error("invalid {what} value {value}")]
    InvalidEnum { what: &'static str, value: u32 },
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("unknown opcode 0x{0:08x}")]
    UnknownOpcode(u32),
    #[error("declared command size {0} is not representable on this platform")]
    UnrepresentableSize(u64),
    #[error("declared command size {0} is smaller than the command header")]
    RuntCommand(u64),
    #[error("trailing bytes after command payload")]
    TrailingBytes,
    #[error("command stream is poisoned by an earlier fatal error")]
    Poisoned,

    #[error("null object id used where a live {0:?} is required")]
    NullId(ObjectType),
    #[error("{ty:?} id {id} is out of range")]
    IdOutOfRange { ty: ObjectType, id: u32 },
    #[error("{ty:?} id {id} is not allocated")]
    NotAllocated { ty: ObjectType, id: u32 },
    #[error("{ty:?} id {id} is not reserved")]
    NotReserved { ty: ObjectType, id: u32 },
    #[error("{ty:?} id {id} is not free")]
    SlotOccupied { ty: ObjectType, id: u32 },
    #[error("{ty:?} id {id} generation {generation} does not exceed current generation {current}")]
    StaleGeneration {
        ty: ObjectType,
        id: u32,
        generation: u32,
        current: u32,
    },
    #[error("{ty:?} id {id} generation {generation} does not match owner generation {current}")]
    GenerationMismatch {
        ty: ObjectType,
        id: u32,
        generation: u32,
        current: u32,
    },

    #[error("future id {0} does not name a tracked event")]
    UnknownFuture(u64),
    #[error("future id {0} is tracked with a different event kind")]
    FutureKindMismatch(u64),
}
