use crate::error::WireError;

/// Object id permanently reserved to mean "null / no object".
pub const NULL_OBJECT_ID: u32 = 0;

/// Identity of one logical wire object.
///
/// `id` is a small dense integer reused after the object is freed;
/// `generation` is bumped on every reuse so a stale reference carried by an
/// in-flight message resolves to "gone" instead of aliasing the new
/// occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    pub id: u32,
    pub generation: u32,
}

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle {
        id: NULL_OBJECT_ID,
        generation: 0,
    };

    pub fn is_null(&self) -> bool {
        self.id == NULL_OBJECT_ID
    }
}

/// Wire object kinds. Client and server each keep one slot table per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectType {
    Device = 0,
    Buffer = 1,
    Texture = 2,
    Queue = 3,
}

impl ObjectType {
    pub const ALL: [ObjectType; 4] = [
        ObjectType::Device,
        ObjectType::Buffer,
        ObjectType::Texture,
        ObjectType::Queue,
    ];

    pub fn from_u32(value: u32) -> Result<Self, WireError> {
        Ok(match value {
            0 => ObjectType::Device,
            1 => ObjectType::Buffer,
            2 => ObjectType::Texture,
            3 => ObjectType::Queue,
            _ => {
                return Err(WireError::InvalidEnum {
                    what: "object type",
                    value,
                })
            }
        })
    }
}
