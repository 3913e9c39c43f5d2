//! Server half of the aero GPU wire: decodes client commands onto a
//! [`Backend`] and reports async results back.

mod backend;
mod null;
mod server;

pub use backend::{Backend, BackendError, Continuation, DeviceEventSink};
pub use null::{
    NullBackend, NullBuffer, NullCommandBuffer, NullCommandEncoder, NullDevice, NullFence,
    NullQueue, NullShaderModule,
};
pub use server::Server;
