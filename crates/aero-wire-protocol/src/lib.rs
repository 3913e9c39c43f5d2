//! Wire format shared by the aero-wire client and server.
//!
//! This crate owns everything both ends must agree on byte-for-byte: object
//! handles and their generational tables, the command records, the chunked
//! serializer used to write them, and the reassembling handler used to read
//! them back.

pub mod chunked;
pub mod cmd;
pub mod error;
pub mod handle;
pub mod serializer;
pub mod table;
pub mod types;
pub mod wire;

pub use chunked::{ChunkedCommandHandler, CommandHandler};
pub use cmd::{ReturnWireCmd, WireCmd, WireCommand};
pub use error::{DecodeError, ErrorKind, Result, TableError, WireError};
pub use handle::ObjectHandle;
pub use serializer::{ChunkedCommandSerializer, CommandSerializer, MemoryTransport};
pub use table::{Lookup, ObjectTable};
pub use types::{
    BufferDescriptor, BufferUsages, CompilationMessage, CompilationMessageType, DeviceLostReason,
    ErrorFilter, ErrorType, MapMode, ObjectType, RequestStatus,
};
pub use wire::{CmdHeader, CMD_ALIGN, CMD_HEADER_SIZE};
