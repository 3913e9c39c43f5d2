use thiserror::Error;

use crate::handle::ObjectHandle;
use crate::types::ObjectType;

pub type Result<T> = std::result::Result<T, WireError>;

/// Malformed bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of command data")]
    UnexpectedEof,

    #[error("invalid {field} value {value}")]
    InvalidEnum { field: &'static str, value: u32 },

    #[error("invalid UTF-8 in command payload")]
    InvalidUtf8,

    #[error("unknown command id {0:#x}")]
    UnknownCommand(u32),

    #[error("bad size_bytes {size_bytes} for command {command_id:#x}")]
    BadSizeBytes { command_id: u32, size_bytes: u64 },

    #[error("{0} unexpected bytes after payload")]
    TrailingGarbage(usize),
}

/// Misuse of an [`ObjectTable`](crate::table::ObjectTable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("handle {0} names the null object")]
    Null(ObjectHandle),

    #[error("handle {handle} collides with an allocated slot")]
    AlreadyAllocated { handle: ObjectHandle },

    #[error("handle {handle} does not match slot generation {expected}")]
    GenerationMismatch { handle: ObjectHandle, expected: u32 },

    #[error("handle {handle} skips ahead of the next unissued id {next}")]
    OutOfSequence { handle: ObjectHandle, next: u32 },

    #[error("handle {0} does not name a live object")]
    NotLive(ObjectHandle),
}

/// How a [`WireError`] affects the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// One command was semantically invalid; the connection stays up.
    Validation,
    /// The byte stream can no longer be trusted; the connection goes down.
    Fatal,
    /// The connection is already down.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("wire connection is disconnected")]
    Disconnected,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("{object_type:?} table: {source}")]
    Table {
        object_type: ObjectType,
        #[source]
        source: TableError,
    },

    #[error("{object_type:?} handle {handle} is not known")]
    UnknownObject {
        object_type: ObjectType,
        handle: ObjectHandle,
    },

    #[error("transport could not provide {size} bytes of command space")]
    TransportAllocation { size: usize },

    #[error("transport flush failed")]
    TransportFlush,

    #[error("transport corrupted: {0}")]
    TransportCorrupt(&'static str),

    #[error("could not reserve {0} bytes for an incoming command")]
    OutOfMemory(u64),

    #[error("trailing data is {actual} bytes but the command declares {declared}")]
    TrailingLength { declared: u64, actual: usize },

    #[error("validation error: {0}")]
    Validation(String),
}

impl WireError {
    pub fn table(object_type: ObjectType, source: TableError) -> Self {
        WireError::Table {
            object_type,
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::Disconnected => ErrorKind::Disconnected,
            WireError::Validation(_) => ErrorKind::Validation,
            WireError::Decode(_)
            | WireError::Table { .. }
            | WireError::UnknownObject { .. }
            | WireError::TransportAllocation { .. }
            | WireError::TransportFlush
            | WireError::TransportCorrupt(_)
            | WireError::OutOfMemory(_)
            | WireError::TrailingLength { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}
