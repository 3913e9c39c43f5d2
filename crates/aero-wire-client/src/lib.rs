//! Client half of the aero GPU wire.
//!
//! [`Client`] mirrors a WebGPU-style object API. Each call allocates handles
//! locally and serializes a command; async results come back as return
//! commands fed to [`CommandHandler::handle_commands`](aero_wire_protocol::CommandHandler).

mod buffer;
mod client;
mod device;
mod encoder;
mod fence;
mod objects;
mod queue;
mod requests;
mod shader;

pub use client::Client;
pub use objects::{
    Buffer, CommandBuffer, CommandEncoder, Device, Fence, Queue, ShaderModule, WireObject,
};
pub use requests::{
    BufferMapState, CompilationInfoCallback, DeviceLostCallback, FenceCompletionCallback,
    MapAsyncCallback, PopErrorScopeCallback, UncapturedErrorCallback, WorkDoneCallback,
};
