//! Plain enums and flag sets shared by both ends of the wire.
//!
//! Everything here travels as a little-endian `u32` inside a command record.
//! Decoding an unknown discriminant is a [`DecodeError::InvalidEnum`].

use bitflags::bitflags;

use crate::error::DecodeError;
use crate::handle::ObjectHandle;
use crate::wire::{push_u32, push_u64, Reader};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl $name {
            pub const fn to_u32(self) -> u32 {
                self as u32
            }

            pub fn from_u32(value: u32) -> Result<Self, DecodeError> {
                match value {
                    $( $value => Ok(Self::$variant), )*
                    _ => Err(DecodeError::InvalidEnum {
                        field: stringify!($name),
                        value,
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Kind of object a handle refers to. Each kind has its own id space.
    pub enum ObjectType {
        Device = 0,
        Queue = 1,
        Buffer = 2,
        ShaderModule = 3,
        CommandEncoder = 4,
        CommandBuffer = 5,
        Fence = 6,
    }
}

wire_enum! {
    /// Outcome delivered to every async request callback, exactly once.
    pub enum RequestStatus {
        Success = 0,
        /// The request itself was invalid.
        Error = 1,
        /// The server gave up on the request without a specific reason.
        Unknown = 2,
        /// The owning device was lost or destroyed first.
        DeviceLost = 3,
        /// The target object was released while the request was in flight.
        DestroyedBeforeCallback = 4,
        /// The buffer was unmapped while the map request was in flight.
        UnmappedBeforeCallback = 5,
        /// The connection went away.
        Disconnected = 6,
    }
}

wire_enum! {
    pub enum DeviceLostReason {
        Unknown = 0,
        Destroyed = 1,
        ConnectionLost = 2,
    }
}

wire_enum! {
    pub enum ErrorFilter {
        Validation = 0,
        OutOfMemory = 1,
        Internal = 2,
    }
}

wire_enum! {
    pub enum ErrorType {
        NoError = 0,
        Validation = 1,
        OutOfMemory = 2,
        Internal = 3,
        Unknown = 4,
    }
}

wire_enum! {
    pub enum CompilationMessageType {
        Error = 0,
        Warning = 1,
        Info = 2,
    }
}

impl ErrorFilter {
    pub fn matches(self, ty: ErrorType) -> bool {
        matches!(
            (self, ty),
            (ErrorFilter::Validation, ErrorType::Validation)
                | (ErrorFilter::OutOfMemory, ErrorType::OutOfMemory)
                | (ErrorFilter::Internal, ErrorType::Internal)
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsages: u32 {
        const MAP_READ = 1 << 0;
        const MAP_WRITE = 1 << 1;
        const COPY_SRC = 1 << 2;
        const COPY_DST = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const UNIFORM = 1 << 6;
        const STORAGE = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

/// One diagnostic produced while compiling a shader module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationMessage {
    pub kind: CompilationMessageType,
    pub line_num: u64,
    pub line_pos: u64,
    pub message: String,
}

/// Encodes compilation messages into the trailing blob of
/// `ShaderModuleGetCompilationInfoCallback`.
///
/// Layout: `count: u32`, then per message `kind: u32, line_num: u64,
/// line_pos: u64, len: u32, utf8 bytes`.
pub fn encode_compilation_messages(messages: &[CompilationMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, messages.len() as u32);
    for msg in messages {
        push_u32(&mut out, msg.kind.to_u32());
        push_u64(&mut out, msg.line_num);
        push_u64(&mut out, msg.line_pos);
        push_u32(&mut out, msg.message.len() as u32);
        out.extend_from_slice(msg.message.as_bytes());
    }
    out
}

pub fn decode_compilation_messages(bytes: &[u8]) -> Result<Vec<CompilationMessage>, DecodeError> {
    let mut r = Reader::new(bytes);
    let count = r.read_u32()? as usize;
    // Each message needs at least 24 bytes; refuse counts the blob cannot hold.
    if count > r.remaining() / 24 {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut messages = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = CompilationMessageType::from_u32(r.read_u32()?)?;
        let line_num = r.read_u64()?;
        let line_pos = r.read_u64()?;
        let len = r.read_u32()? as usize;
        let message = r.read_str(len)?.to_owned();
        messages.push(CompilationMessage {
            kind,
            line_num,
            line_pos,
            message,
        });
    }
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingGarbage(r.remaining()));
    }
    Ok(messages)
}

/// Packs handles as consecutive `(id, generation)` pairs.
pub fn encode_handles(handles: &[ObjectHandle]) -> Vec<u8> {
    let mut out = Vec::with_capacity(handles.len() * 8);
    for handle in handles {
        push_u32(&mut out, handle.id);
        push_u32(&mut out, handle.generation);
    }
    out
}

pub fn decode_handles(bytes: &[u8]) -> Result<Vec<ObjectHandle>, DecodeError> {
    if bytes.len() % 8 != 0 {
        return Err(DecodeError::TrailingGarbage(bytes.len() % 8));
    }
    let mut r = Reader::new(bytes);
    let mut handles = Vec::with_capacity(bytes.len() / 8);
    while r.remaining() != 0 {
        handles.push(ObjectHandle::new(r.read_u32()?, r.read_u32()?));
    }
    Ok(handles)
}
