//! Framed command records for the GPU command-wire protocol.
//!
//! Every command is framed as:
//!
//! ```text
//! offset 0   u64  cmd_size   (total framed size, 8-aligned)
//! offset 8   u32  opcode
//! offset 12  u32  reserved (0)
//! offset 16  ..   fixed fields, then length-prefixed trailing sections
//! ```
//!
//! Forward commands travel client to server; return commands travel server
//! to client (typically callback results). Variable-length sections are
//! length-prefixed by fixed fields earlier in the same record; bulk data
//! blobs ride as extension payloads appended after the record on
//! [`EXT_ALIGN`](crate::EXT_ALIGN) boundaries.
//!
//! All fields are little-endian. The layout is the bit-exact compatibility
//! surface: changing it breaks interop with an existing peer.

use bitflags::bitflags;

use crate::codec::{string_wire_size, CmdReader, CmdWriter};
use crate::error::WireError;
use crate::handle::{ObjectHandle, ObjectType};
use crate::EXT_ALIGN;

/// Byte length of the fixed frame header (`cmd_size` + opcode + reserved).
pub const CMD_HEADER_LEN: usize = 16;

pub(crate) fn align_up(v: usize, a: usize) -> usize {
    debug_assert!(a.is_power_of_two());
    (v + (a - 1)) & !(a - 1)
}

bitflags! {
    /// Buffer usage bits carried by [`BufferDescriptor`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const VERTEX = 1 << 4;
        const INDEX = 1 << 5;
        const UNIFORM = 1 << 6;
    }
}

bitflags! {
    /// Optional device capabilities a client may require at request time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureBits: u64 {
        const TEXTURE_COMPRESSION_BC = 1 << 0;
        const TIMESTAMP_QUERY = 1 << 1;
        const SHADER_F16 = 1 << 2;
        const MAPPABLE_PRIMARY = 1 << 3;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub label: String,
    pub required_features: FeatureBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapMode {
    Read = 1,
    Write = 2,
}

impl MapMode {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            1 => MapMode::Read,
            2 => MapMode::Write,
            _ => {
                return Err(WireError::InvalidEnum {
                    what: "map mode",
                    value,
                })
            }
        })
    }
}

/// Completion status carried in return-command payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CallbackStatus {
    Success = 0,
    Error = 1,
    Shutdown = 2,
}

impl CallbackStatus {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0 => CallbackStatus::Success,
            1 => CallbackStatus::Error,
            2 => CallbackStatus::Shutdown,
            _ => {
                return Err(WireError::InvalidEnum {
                    what: "callback status",
                    value,
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceLostReason {
    Unknown = 0,
    Destroyed = 1,
    Shutdown = 2,
}

impl DeviceLostReason {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0 => DeviceLostReason::Unknown,
            1 => DeviceLostReason::Destroyed,
            2 => DeviceLostReason::Shutdown,
            _ => {
                return Err(WireError::InvalidEnum {
                    what: "device lost reason",
                    value,
                })
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmdOpcode {
    RequestDevice = 0x0001,
    CreateBuffer = 0x0002,
    CreateTexture = 0x0003,
    GetQueue = 0x0004,
    WriteBuffer = 0x0005,
    MapBufferAsync = 0x0006,
    UnregisterObject = 0x0007,
}

impl CmdOpcode {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0x0001 => Self::RequestDevice,
            0x0002 => Self::CreateBuffer,
            0x0003 => Self::CreateTexture,
            0x0004 => Self::GetQueue,
            0x0005 => Self::WriteBuffer,
            0x0006 => Self::MapBufferAsync,
            0x0007 => Self::UnregisterObject,
            _ => return Err(WireError::UnknownOpcode(value)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReturnOpcode {
    RequestDeviceReturn = 0x1001,
    MapBufferReturn = 0x1002,
    DeviceLost = 0x1003,
}

impl ReturnOpcode {
    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0x1001 => Self::RequestDeviceReturn,
            0x1002 => Self::MapBufferReturn,
            0x1003 => Self::DeviceLost,
            _ => return Err(WireError::UnknownOpcode(value)),
        })
    }
}

/// Shared contract between command records and the chunked serializer.
///
/// `payload_size` covers the fixed fields plus inline trailing sections but
/// not the frame header or extension blobs; `extensions` exposes the bulk
/// payloads the serializer appends after the record.
pub trait WireCommand: Sized {
    fn opcode(&self) -> u32;
    fn payload_size(&self) -> usize;
    fn extensions(&self) -> Vec<&[u8]> {
        Vec::new()
    }
    fn serialize_payload(&self, w: &mut CmdWriter<'_>);
    fn decode(opcode: u32, r: &mut CmdReader<'_>) -> Result<Self, WireError>;
}

/// Total framed size of a command: header + payload, rounded up, plus each
/// extension blob rounded up to [`EXT_ALIGN`](crate::EXT_ALIGN).
pub fn framed_size<C: WireCommand>(cmd: &C) -> usize {
    let mut total = align_up(CMD_HEADER_LEN + cmd.payload_size(), EXT_ALIGN);
    for ext in cmd.extensions() {
        total += align_up(ext.len(), EXT_ALIGN);
    }
    total
}

/// Client-to-server commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardCmd {
    RequestDevice {
        device: ObjectHandle,
        future_id: u64,
        desc: DeviceDescriptor,
    },
    CreateBuffer {
        device_id: u32,
        buffer: ObjectHandle,
        desc: BufferDescriptor,
    },
    CreateTexture {
        device_id: u32,
        texture: ObjectHandle,
        desc: TextureDescriptor,
    },
    GetQueue {
        device_id: u32,
        queue: ObjectHandle,
    },
    WriteBuffer {
        buffer_id: u32,
        offset: u64,
        data: Vec<u8>,
    },
    MapBufferAsync {
        buffer_id: u32,
        future_id: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    UnregisterObject {
        ty: ObjectType,
        id: u32,
    },
}

impl WireCommand for ForwardCmd {
    fn opcode(&self) -> u32 {
        let op = match self {
            ForwardCmd::RequestDevice { .. } => CmdOpcode::RequestDevice,
            ForwardCmd::CreateBuffer { .. } => CmdOpcode::CreateBuffer,
            ForwardCmd::CreateTexture { .. } => CmdOpcode::CreateTexture,
            ForwardCmd::GetQueue { .. } => CmdOpcode::GetQueue,
            ForwardCmd::WriteBuffer { .. } => CmdOpcode::WriteBuffer,
            ForwardCmd::MapBufferAsync { .. } => CmdOpcode::MapBufferAsync,
            ForwardCmd::UnregisterObject { .. } => CmdOpcode::UnregisterObject,
        };
        op as u32
    }

    fn payload_size(&self) -> usize {
        match self {
            ForwardCmd::RequestDevice { desc, .. } => 8 + 8 + 8 + string_wire_size(&desc.label),
            ForwardCmd::CreateBuffer { .. } => 4 + 8 + 8 + 4,
            ForwardCmd::CreateTexture { desc, .. } => {
                4 + 8 + 4 + 4 + 4 + string_wire_size(&desc.label)
            }
            ForwardCmd::GetQueue { .. } => 4 + 8,
            ForwardCmd::WriteBuffer { .. } => 4 + 8 + 8,
            ForwardCmd::MapBufferAsync { .. } => 4 + 8 + 4 + 8 + 8,
            ForwardCmd::UnregisterObject { .. } => 4 + 4,
        }
    }

    fn extensions(&self) -> Vec<&[u8]> {
        match self {
            ForwardCmd::WriteBuffer { data, .. } => vec![data.as_slice()],
            _ => Vec::new(),
        }
    }

    fn serialize_payload(&self, w: &mut CmdWriter<'_>) {
        match self {
            ForwardCmd::RequestDevice {
                device,
                future_id,
                desc,
            } => {
                w.write_handle(*device);
                w.write_u64(*future_id);
                w.write_u64(desc.required_features.bits());
                w.write_string(&desc.label);
            }
            ForwardCmd::CreateBuffer {
                device_id,
                buffer,
                desc,
            } => {
                w.write_u32(*device_id);
                w.write_handle(*buffer);
                w.write_u64(desc.size);
                w.write_u32(desc.usage.bits());
            }
            ForwardCmd::CreateTexture {
                device_id,
                texture,
                desc,
            } => {
                w.write_u32(*device_id);
                w.write_handle(*texture);
                w.write_u32(desc.width);
                w.write_u32(desc.height);
                w.write_u32(desc.format);
                w.write_string(&desc.label);
            }
            ForwardCmd::GetQueue { device_id, queue } => {
                w.write_u32(*device_id);
                w.write_handle(*queue);
            }
            ForwardCmd::WriteBuffer {
                buffer_id,
                offset,
                data,
            } => {
                // `data` itself travels as the extension blob.
                w.write_u32(*buffer_id);
                w.write_u64(*offset);
                w.write_u64(data.len() as u64);
            }
            ForwardCmd::MapBufferAsync {
                buffer_id,
                future_id,
                mode,
                offset,
                size,
            } => {
                w.write_u32(*buffer_id);
                w.write_u64(*future_id);
                w.write_u32(*mode as u32);
                w.write_u64(*offset);
                w.write_u64(*size);
            }
            ForwardCmd::UnregisterObject { ty, id } => {
                w.write_u32(*ty as u32);
                w.write_u32(*id);
            }
        }
    }

    fn decode(opcode: u32, r: &mut CmdReader<'_>) -> Result<Self, WireError> {
        let cmd = match CmdOpcode::from_u32(opcode)? {
            CmdOpcode::RequestDevice => {
                let device = r.read_handle()?;
                let future_id = r.read_u64()?;
                let required_features = FeatureBits::from_bits_retain(r.read_u64()?);
                let label = r.read_string("device label")?;
                ForwardCmd::RequestDevice {
                    device,
                    future_id,
                    desc: DeviceDescriptor {
                        label,
                        required_features,
                    },
                }
            }
            CmdOpcode::CreateBuffer => {
                let device_id = r.read_u32()?;
                let buffer = r.read_handle()?;
                let size = r.read_u64()?;
                let usage = BufferUsage::from_bits_retain(r.read_u32()?);
                ForwardCmd::CreateBuffer {
                    device_id,
                    buffer,
                    desc: BufferDescriptor { size, usage },
                }
            }
            CmdOpcode::CreateTexture => {
                let device_id = r.read_u32()?;
                let texture = r.read_handle()?;
                let width = r.read_u32()?;
                let height = r.read_u32()?;
                let format = r.read_u32()?;
                let label = r.read_string("texture label")?;
                ForwardCmd::CreateTexture {
                    device_id,
                    texture,
                    desc: TextureDescriptor {
                        label,
                        width,
                        height,
                        format,
                    },
                }
            }
            CmdOpcode::GetQueue => ForwardCmd::GetQueue {
                device_id: r.read_u32()?,
                queue: r.read_handle()?,
            },
            CmdOpcode::WriteBuffer => {
                let buffer_id = r.read_u32()?;
                let offset = r.read_u64()?;
                let len = r.read_u64()?;
                let len = usize::try_from(len).map_err(|_| WireError::UnrepresentableSize(len))?;
                r.align_to(EXT_ALIGN);
                let data = r.read_bytes(len)?.to_vec();
                ForwardCmd::WriteBuffer {
                    buffer_id,
                    offset,
                    data,
                }
            }
            CmdOpcode::MapBufferAsync => {
                let buffer_id = r.read_u32()?;
                let future_id = r.read_u64()?;
                let mode = MapMode::from_u32(r.read_u32()?)?;
                let offset = r.read_u64()?;
                let size = r.read_u64()?;
                ForwardCmd::MapBufferAsync {
                    buffer_id,
                    future_id,
                    mode,
                    offset,
                    size,
                }
            }
            CmdOpcode::UnregisterObject => ForwardCmd::UnregisterObject {
                ty: ObjectType::from_u32(r.read_u32()?)?,
                id: r.read_u32()?,
            },
        };
        r.expect_end(EXT_ALIGN)?;
        Ok(cmd)
    }
}

/// Server-to-client commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnCmd {
    RequestDeviceReturn {
        future_id: u64,
        status: CallbackStatus,
        message: String,
    },
    MapBufferReturn {
        future_id: u64,
        status: CallbackStatus,
        message: String,
        data: Vec<u8>,
    },
    DeviceLost {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: String,
    },
}

impl WireCommand for ReturnCmd {
    fn opcode(&self) -> u32 {
        let op = match self {
            ReturnCmd::RequestDeviceReturn { .. } => ReturnOpcode::RequestDeviceReturn,
            ReturnCmd::MapBufferReturn { .. } => ReturnOpcode::MapBufferReturn,
            ReturnCmd::DeviceLost { .. } => ReturnOpcode::DeviceLost,
        };
        op as u32
    }

    fn payload_size(&self) -> usize {
        match self {
            ReturnCmd::RequestDeviceReturn { message, .. } => 8 + 4 + string_wire_size(message),
            ReturnCmd::MapBufferReturn { message, .. } => 8 + 4 + 8 + string_wire_size(message),
            ReturnCmd::DeviceLost { message, .. } => 8 + 4 + string_wire_size(message),
        }
    }

    fn extensions(&self) -> Vec<&[u8]> {
        match self {
            ReturnCmd::MapBufferReturn { data, .. } => vec![data.as_slice()],
            _ => Vec::new(),
        }
    }

    fn serialize_payload(&self, w: &mut CmdWriter<'_>) {
        match self {
            ReturnCmd::RequestDeviceReturn {
                future_id,
                status,
                message,
            } => {
                w.write_u64(*future_id);
                w.write_u32(*status as u32);
                w.write_string(message);
            }
            ReturnCmd::MapBufferReturn {
                future_id,
                status,
                message,
                data,
            } => {
                w.write_u64(*future_id);
                w.write_u32(*status as u32);
                w.write_u64(data.len() as u64);
                w.write_string(message);
            }
            ReturnCmd::DeviceLost {
                device,
                reason,
                message,
            } => {
                w.write_handle(*device);
                w.write_u32(*reason as u32);
                w.write_string(message);
            }
        }
    }

    fn decode(opcode: u32, r: &mut CmdReader<'_>) -> Result<Self, WireError> {
        let cmd = match ReturnOpcode::from_u32(opcode)? {
            ReturnOpcode::RequestDeviceReturn => ReturnCmd::RequestDeviceReturn {
                future_id: r.read_u64()?,
                status: CallbackStatus::from_u32(r.read_u32()?)?,
                message: r.read_string("request device message")?,
            },
            ReturnOpcode::MapBufferReturn => {
                let future_id = r.read_u64()?;
                let status = CallbackStatus::from_u32(r.read_u32()?)?;
                let len = r.read_u64()?;
                let len = usize::try_from(len).map_err(|_| WireError::UnrepresentableSize(len))?;
                let message = r.read_string("map buffer message")?;
                r.align_to(EXT_ALIGN);
                let data = r.read_bytes(len)?.to_vec();
                ReturnCmd::MapBufferReturn {
                    future_id,
                    status,
                    message,
                    data,
                }
            }
            ReturnOpcode::DeviceLost => ReturnCmd::DeviceLost {
                device: r.read_handle()?,
                reason: DeviceLostReason::from_u32(r.read_u32()?)?,
                message: r.read_string("device lost message")?,
            },
        };
        r.expect_end(EXT_ALIGN)?;
        Ok(cmd)
    }
}
