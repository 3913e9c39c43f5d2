//! The seam between the wire server and a GPU implementation.
//!
//! Synchronous entry points return their object (or a [`BackendError`]);
//! asynchronous ones receive a [`Continuation`] that the backend completes
//! later, possibly from another thread.

use std::sync::mpsc::Sender;

use aero_wire_protocol::{
    BufferDescriptor, CompilationMessage, DeviceLostReason, ErrorFilter, ErrorType, MapMode,
    ObjectHandle, RequestStatus,
};
use thiserror::Error;

/// A backend call failed. The failure is reported through the device's error
/// machinery by the backend itself; the server only logs it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} error: {message}")]
pub struct BackendError {
    pub kind: ErrorType,
    pub message: String,
}

impl BackendError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorType::Validation,
            message: message.into(),
        }
    }
}

pub trait Backend {
    type Device;
    type Queue;
    type Buffer;
    type ShaderModule;
    type CommandEncoder;
    type CommandBuffer;
    type Fence;

    /// Installs the sink the device reports uncaptured errors and loss to.
    fn device_set_event_sink(&mut self, device: &Self::Device, sink: DeviceEventSink);

    fn device_get_queue(&mut self, device: &Self::Device) -> Result<Self::Queue, BackendError>;

    fn device_create_buffer(
        &mut self,
        device: &Self::Device,
        desc: &BufferDescriptor,
    ) -> Result<Self::Buffer, BackendError>;

    fn device_create_shader_module(
        &mut self,
        device: &Self::Device,
        wgsl: &str,
    ) -> Result<Self::ShaderModule, BackendError>;

    fn device_create_command_encoder(
        &mut self,
        device: &Self::Device,
    ) -> Result<Self::CommandEncoder, BackendError>;

    /// Loses the device on purpose. The client reports the loss to its own
    /// callback, so no lost event is expected through the sink.
    fn device_destroy(&mut self, device: &Self::Device);

    fn device_push_error_scope(&mut self, device: &Self::Device, filter: ErrorFilter);

    fn device_pop_error_scope(
        &mut self,
        device: &Self::Device,
        done: Continuation<(ErrorType, String)>,
    );

    fn queue_submit(
        &mut self,
        queue: &Self::Queue,
        command_buffers: &[&Self::CommandBuffer],
    ) -> Result<(), BackendError>;

    fn queue_write_buffer(
        &mut self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn queue_on_submitted_work_done(&mut self, queue: &Self::Queue, done: Continuation<()>);

    fn queue_create_fence(
        &mut self,
        queue: &Self::Queue,
        initial_value: u64,
    ) -> Result<Self::Fence, BackendError>;

    fn queue_signal(
        &mut self,
        queue: &Self::Queue,
        fence: &Self::Fence,
        value: u64,
    ) -> Result<(), BackendError>;

    /// Completes with the fence's value once it reaches `value`.
    fn fence_on_completion(&mut self, fence: &Self::Fence, value: u64, done: Continuation<u64>);

    /// Completes with the contents of the mapped range.
    fn buffer_map_async(
        &mut self,
        buffer: &Self::Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        done: Continuation<Vec<u8>>,
    );

    /// Stores client-written bytes into the current mapping.
    fn buffer_write_mapped(
        &mut self,
        buffer: &Self::Buffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn buffer_unmap(&mut self, buffer: &Self::Buffer) -> Result<(), BackendError>;

    /// Frees the buffer's storage. Queued maps fail and later use is a
    /// validation error.
    fn buffer_destroy(&mut self, buffer: &Self::Buffer);

    fn shader_module_get_compilation_info(
        &mut self,
        shader_module: &Self::ShaderModule,
        done: Continuation<Vec<CompilationMessage>>,
    );

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: &mut Self::CommandEncoder,
        source: &Self::Buffer,
        source_offset: u64,
        destination: &Self::Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), BackendError>;

    fn command_encoder_finish(
        &mut self,
        encoder: &mut Self::CommandEncoder,
    ) -> Result<Self::CommandBuffer, BackendError>;

    /// Gives the backend a chance to make progress on async work. Returns the
    /// number of continuations completed.
    fn poll(&mut self) -> usize {
        0
    }
}

/// A finished async request, ready to become a return command.
#[derive(Debug)]
pub(crate) enum Completion {
    MapAsync {
        buffer: ObjectHandle,
        serial: u64,
        result: Result<Vec<u8>, RequestStatus>,
    },
    CompilationInfo {
        shader_module: ObjectHandle,
        serial: u64,
        result: Result<Vec<CompilationMessage>, RequestStatus>,
    },
    WorkDone {
        queue: ObjectHandle,
        serial: u64,
        result: Result<(), RequestStatus>,
    },
    FenceCompletion {
        fence: ObjectHandle,
        serial: u64,
        result: Result<u64, RequestStatus>,
    },
    PopErrorScope {
        device: ObjectHandle,
        serial: u64,
        result: Result<(ErrorType, String), RequestStatus>,
    },
}

#[derive(Debug)]
pub(crate) enum ServerEvent {
    Completion(Completion),
    UncapturedError {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
    DeviceLost {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: String,
    },
}

type Wrap<T> = fn(ObjectHandle, u64, Result<T, RequestStatus>) -> Completion;

/// One-shot completion handle for an async backend call.
///
/// Dropping it without calling [`complete`](Self::complete) or
/// [`fail`](Self::fail) resolves the request as [`RequestStatus::Unknown`].
#[must_use]
pub struct Continuation<T> {
    target: ObjectHandle,
    serial: u64,
    sender: Option<Sender<ServerEvent>>,
    wrap: Wrap<T>,
}

impl<T> Continuation<T> {
    pub(crate) fn new(
        target: ObjectHandle,
        serial: u64,
        sender: Sender<ServerEvent>,
        wrap: Wrap<T>,
    ) -> Self {
        Self {
            target,
            serial,
            sender: Some(sender),
            wrap,
        }
    }

    /// Handle of the object the request was made on.
    pub fn target(&self) -> ObjectHandle {
        self.target
    }

    pub fn complete(mut self, value: T) {
        self.send(Ok(value));
    }

    pub fn fail(mut self, status: RequestStatus) {
        self.send(Err(status));
    }

    fn send(&mut self, result: Result<T, RequestStatus>) {
        if let Some(sender) = self.sender.take() {
            // A dropped receiver means the server is gone; nobody is waiting.
            let _ = sender.send(ServerEvent::Completion((self.wrap)(
                self.target,
                self.serial,
                result,
            )));
        }
    }
}

impl<T> Drop for Continuation<T> {
    fn drop(&mut self) {
        self.send(Err(RequestStatus::Unknown));
    }
}

impl<T> std::fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Continuation")
            .field("target", &self.target)
            .field("serial", &self.serial)
            .field("pending", &self.sender.is_some())
            .finish()
    }
}

/// Where a device reports events that are not tied to one request.
#[derive(Debug, Clone)]
pub struct DeviceEventSink {
    device: ObjectHandle,
    sender: Sender<ServerEvent>,
}

impl DeviceEventSink {
    pub(crate) fn new(device: ObjectHandle, sender: Sender<ServerEvent>) -> Self {
        Self { device, sender }
    }

    pub fn device(&self) -> ObjectHandle {
        self.device
    }

    pub fn uncaptured_error(&self, error_type: ErrorType, message: &str) {
        let _ = self.sender.send(ServerEvent::UncapturedError {
            device: self.device,
            error_type,
            message: message.to_owned(),
        });
    }

    pub fn device_lost(&self, reason: DeviceLostReason, message: &str) {
        let _ = self.sender.send(ServerEvent::DeviceLost {
            device: self.device,
            reason,
            message: message.to_owned(),
        });
    }
}
