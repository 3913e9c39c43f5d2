use std::sync::mpsc::{channel, Receiver, Sender};

use aero_wire_protocol::cmd::{
    BufferMapAsyncCallback, DeviceLostCallback, DevicePopErrorScopeCallback,
    DeviceUncapturedErrorCallback, FenceOnCompletionCallback, QueueWorkDoneCallback,
    ShaderModuleGetCompilationInfoCallback,
};
use aero_wire_protocol::types::{decode_handles, encode_compilation_messages};
use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, ChunkedCommandHandler, ChunkedCommandSerializer, CmdHeader,
    CommandHandler, CommandSerializer, ErrorFilter, ErrorKind, ErrorType, MapMode, ObjectHandle,
    ObjectTable, ObjectType, RequestStatus, WireCmd, WireCommand, WireError,
};
use tracing::{debug, trace, warn};

use crate::backend::{Backend, BackendError, Completion, Continuation, DeviceEventSink, ServerEvent};

macro_rules! with_table {
    ($server:expr, $ty:expr, |$table:ident| $body:expr) => {
        match $ty {
            ObjectType::Device => {
                let $table = &mut $server.devices;
                $body
            }
            ObjectType::Queue => {
                let $table = &mut $server.queues;
                $body
            }
            ObjectType::Buffer => {
                let $table = &mut $server.buffers;
                $body
            }
            ObjectType::ShaderModule => {
                let $table = &mut $server.shader_modules;
                $body
            }
            ObjectType::CommandEncoder => {
                let $table = &mut $server.command_encoders;
                $body
            }
            ObjectType::CommandBuffer => {
                let $table = &mut $server.command_buffers;
                $body
            }
            ObjectType::Fence => {
                let $table = &mut $server.fences;
                $body
            }
        }
    };
}

/// Slots hold `None` for error objects: handles the client allocated whose
/// creation failed. Using one is a validation error, not a protocol error.
type Table<T> = ObjectTable<Option<T>>;

/// Resolves a client-supplied handle. Handles the server never mirrored are
/// fatal.
fn resolve<T>(
    table: &Table<T>,
    object_type: ObjectType,
    handle: ObjectHandle,
) -> Result<Option<&T>, WireError> {
    table
        .get(handle)
        .map(Option::as_ref)
        .ok_or(WireError::UnknownObject {
            object_type,
            handle,
        })
}

fn resolve_mut<T>(
    table: &mut Table<T>,
    object_type: ObjectType,
    handle: ObjectHandle,
) -> Result<Option<&mut T>, WireError> {
    table
        .get_mut(handle)
        .map(Option::as_mut)
        .ok_or(WireError::UnknownObject {
            object_type,
            handle,
        })
}

fn mirror<T>(
    table: &mut Table<T>,
    object_type: ObjectType,
    handle: ObjectHandle,
    object: Option<T>,
) -> Result<(), WireError> {
    table
        .insert(handle, object)
        .map_err(|e| WireError::table(object_type, e))
}

fn created<T>(what: &'static str, result: Result<T, BackendError>) -> Option<T> {
    match result {
        Ok(object) => Some(object),
        Err(err) => {
            debug!(%err, what, "creating error object");
            None
        }
    }
}

fn checked(what: &'static str, result: Result<(), BackendError>) {
    if let Err(err) = result {
        debug!(%err, what, "backend rejected command");
    }
}

/// Server half of a wire connection.
///
/// Decodes client commands, mirrors the client's handles onto backend objects
/// and sends async results back as return commands through `S`.
pub struct Server<B: Backend, S> {
    backend: B,
    serializer: ChunkedCommandSerializer<S>,
    receiver: ChunkedCommandHandler,
    disconnected: bool,
    events: Sender<ServerEvent>,
    inbox: Receiver<ServerEvent>,

    devices: Table<B::Device>,
    queues: Table<B::Queue>,
    buffers: Table<B::Buffer>,
    shader_modules: Table<B::ShaderModule>,
    command_encoders: Table<B::CommandEncoder>,
    command_buffers: Table<B::CommandBuffer>,
    fences: Table<B::Fence>,
}

impl<B: Backend, S: CommandSerializer> Server<B, S> {
    pub fn new(backend: B, serializer: S) -> Self {
        let (events, inbox) = channel();
        Self {
            backend,
            serializer: ChunkedCommandSerializer::new(serializer),
            receiver: ChunkedCommandHandler::new(),
            disconnected: false,
            events,
            inbox,
            devices: ObjectTable::new(),
            queues: ObjectTable::new(),
            buffers: ObjectTable::new(),
            shader_modules: ObjectTable::new(),
            command_encoders: ObjectTable::new(),
            command_buffers: ObjectTable::new(),
            fences: ObjectTable::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn transport(&self) -> &S {
        self.serializer.inner()
    }

    pub fn transport_mut(&mut self) -> &mut S {
        self.serializer.inner_mut()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn ensure_connected(&self) -> Result<(), WireError> {
        if self.disconnected {
            Err(WireError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Binds a client-reserved device handle to a backend device.
    pub fn inject_device(&mut self, handle: ObjectHandle, device: B::Device) -> Result<(), WireError> {
        self.ensure_connected()?;
        let sink = DeviceEventSink::new(handle, self.events.clone());
        self.backend.device_set_event_sink(&device, sink);
        mirror(&mut self.devices, ObjectType::Device, handle, Some(device))
    }

    /// Whether `handle` is mirrored, including as an error object.
    pub fn contains(&self, object_type: ObjectType, handle: ObjectHandle) -> bool {
        match object_type {
            ObjectType::Device => self.devices.contains(handle),
            ObjectType::Queue => self.queues.contains(handle),
            ObjectType::Buffer => self.buffers.contains(handle),
            ObjectType::ShaderModule => self.shader_modules.contains(handle),
            ObjectType::CommandEncoder => self.command_encoders.contains(handle),
            ObjectType::CommandBuffer => self.command_buffers.contains(handle),
            ObjectType::Fence => self.fences.contains(handle),
        }
    }

    /// Number of live mirrored objects of one type.
    pub fn object_count(&self, object_type: ObjectType) -> usize {
        match object_type {
            ObjectType::Device => self.devices.len(),
            ObjectType::Queue => self.queues.len(),
            ObjectType::Buffer => self.buffers.len(),
            ObjectType::ShaderModule => self.shader_modules.len(),
            ObjectType::CommandEncoder => self.command_encoders.len(),
            ObjectType::CommandBuffer => self.command_buffers.len(),
            ObjectType::Fence => self.fences.len(),
        }
    }

    pub fn device(&self, handle: ObjectHandle) -> Option<&B::Device> {
        self.devices.get(handle)?.as_ref()
    }

    pub fn buffer(&self, handle: ObjectHandle) -> Option<&B::Buffer> {
        self.buffers.get(handle)?.as_ref()
    }

    pub fn fence(&self, handle: ObjectHandle) -> Option<&B::Fence> {
        self.fences.get(handle)?.as_ref()
    }

    /// Drops the connection. Idempotent. Tables are left as they are and
    /// queued completions are discarded.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.receiver.reset();
        while self.inbox.try_recv().is_ok() {}
        warn!("wire server disconnected");
    }

    fn escalate<T>(&mut self, result: Result<T, WireError>) -> Result<T, WireError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(%err, "fatal wire error on server");
                self.disconnect();
            }
        }
        result
    }

    fn send<C: WireCommand>(&mut self, cmd: &C, trailing: &[u8]) -> Result<(), WireError> {
        let result = self.serializer.serialize(cmd, trailing);
        self.escalate(result)
    }

    /// Polls the backend and sends whatever completed.
    pub fn tick(&mut self) -> Result<usize, WireError> {
        self.ensure_connected()?;
        self.backend.poll();
        self.flush_completions()
    }

    /// Turns queued completions and device events into return commands and
    /// flushes them. Events for objects the client already destroyed are
    /// dropped. Returns the number of commands sent.
    pub fn flush_completions(&mut self) -> Result<usize, WireError> {
        self.ensure_connected()?;
        let mut sent = 0;
        while let Ok(event) = self.inbox.try_recv() {
            if self.send_event(event)? {
                sent += 1;
            }
        }
        let result = self.serializer.flush();
        self.escalate(result)?;
        Ok(sent)
    }

    fn send_event(&mut self, event: ServerEvent) -> Result<bool, WireError> {
        let (object_type, target) = match &event {
            ServerEvent::Completion(Completion::MapAsync { buffer, .. }) => {
                (ObjectType::Buffer, *buffer)
            }
            ServerEvent::Completion(Completion::CompilationInfo { shader_module, .. }) => {
                (ObjectType::ShaderModule, *shader_module)
            }
            ServerEvent::Completion(Completion::WorkDone { queue, .. }) => {
                (ObjectType::Queue, *queue)
            }
            ServerEvent::Completion(Completion::FenceCompletion { fence, .. }) => {
                (ObjectType::Fence, *fence)
            }
            ServerEvent::Completion(Completion::PopErrorScope { device, .. })
            | ServerEvent::UncapturedError { device, .. }
            | ServerEvent::DeviceLost { device, .. } => (ObjectType::Device, *device),
        };
        if !self.contains(object_type, target) {
            debug!(?object_type, %target, "dropping event for destroyed object");
            return Ok(false);
        }

        match event {
            ServerEvent::Completion(Completion::MapAsync {
                buffer,
                serial,
                result,
            }) => {
                let (status, data) = split(result, Vec::new());
                self.send(
                    &BufferMapAsyncCallback {
                        buffer,
                        request_serial: serial,
                        status: status.to_u32(),
                        data_len: data.len() as u64,
                    },
                    &data,
                )?;
            }
            ServerEvent::Completion(Completion::CompilationInfo {
                shader_module,
                serial,
                result,
            }) => {
                let (status, messages) = split(result, Vec::new());
                let info = if status == RequestStatus::Success {
                    encode_compilation_messages(&messages)
                } else {
                    Vec::new()
                };
                self.send(
                    &ShaderModuleGetCompilationInfoCallback {
                        shader_module,
                        request_serial: serial,
                        status: status.to_u32(),
                        info_len: info.len() as u64,
                    },
                    &info,
                )?;
            }
            ServerEvent::Completion(Completion::WorkDone {
                queue,
                serial,
                result,
            }) => {
                let (status, ()) = split(result, ());
                self.send(
                    &QueueWorkDoneCallback {
                        queue,
                        request_serial: serial,
                        status: status.to_u32(),
                    },
                    &[],
                )?;
            }
            ServerEvent::Completion(Completion::FenceCompletion {
                fence,
                serial,
                result,
            }) => {
                let (status, completed_value) = split(result, 0);
                self.send(
                    &FenceOnCompletionCallback {
                        fence,
                        request_serial: serial,
                        status: status.to_u32(),
                        completed_value,
                    },
                    &[],
                )?;
            }
            ServerEvent::Completion(Completion::PopErrorScope {
                device,
                serial,
                result,
            }) => {
                let (status, (error_type, message)) =
                    split(result, (ErrorType::Unknown, String::new()));
                self.send(
                    &DevicePopErrorScopeCallback {
                        device,
                        request_serial: serial,
                        status: status.to_u32(),
                        error_type: error_type.to_u32(),
                        message_len: message.len() as u64,
                    },
                    message.as_bytes(),
                )?;
            }
            ServerEvent::UncapturedError {
                device,
                error_type,
                message,
            } => {
                self.send(
                    &DeviceUncapturedErrorCallback {
                        device,
                        error_type: error_type.to_u32(),
                        message_len: message.len() as u64,
                    },
                    message.as_bytes(),
                )?;
            }
            ServerEvent::DeviceLost {
                device,
                reason,
                message,
            } => {
                self.send(
                    &DeviceLostCallback {
                        device,
                        reason: reason.to_u32(),
                        message_len: message.len() as u64,
                    },
                    message.as_bytes(),
                )?;
            }
        }
        Ok(true)
    }

    fn dispatch(&mut self, header: CmdHeader, body: &[u8]) -> Result<(), WireError> {
        let cmd = WireCmd::decode(header.command_id, body)?;
        let name = cmd.name();
        trace!(command = name, "server dispatch");
        match self.execute(cmd) {
            Err(err) if err.kind() == ErrorKind::Validation => {
                debug!(%err, command = name, "command failed validation");
                Ok(())
            }
            other => other,
        }
    }

    fn execute(&mut self, cmd: WireCmd<'_>) -> Result<(), WireError> {
        match cmd {
            WireCmd::DestroyObject(cmd, _) => {
                let object_type = ObjectType::from_u32(cmd.object_type)
                    .map_err(|e| WireError::Validation(e.to_string()))?;
                with_table!(self, object_type, |table| {
                    table
                        .free(cmd.handle)
                        .map_err(|e| WireError::table(object_type, e))?;
                });
                Ok(())
            }

            WireCmd::DeviceCreateBuffer(cmd, _) => {
                let device = resolve(&self.devices, ObjectType::Device, cmd.device)?;
                let object = match (device, BufferUsages::from_bits(cmd.usage)) {
                    (Some(device), Some(usage)) => created(
                        "buffer",
                        self.backend.device_create_buffer(
                            device,
                            &BufferDescriptor {
                                size: cmd.size,
                                usage,
                                mapped_at_creation: cmd.mapped_at_creation,
                            },
                        ),
                    ),
                    (Some(_), None) => {
                        debug!(usage = cmd.usage, "unknown buffer usage bits");
                        None
                    }
                    (None, _) => None,
                };
                mirror(&mut self.buffers, ObjectType::Buffer, cmd.result, object)
            }
            WireCmd::DeviceCreateShaderModule(cmd, code) => {
                let device = resolve(&self.devices, ObjectType::Device, cmd.device)?;
                let object = match (device, core::str::from_utf8(code)) {
                    (Some(device), Ok(wgsl)) => created(
                        "shader module",
                        self.backend.device_create_shader_module(device, wgsl),
                    ),
                    (Some(_), Err(err)) => {
                        debug!(%err, "shader source is not UTF-8");
                        None
                    }
                    (None, _) => None,
                };
                mirror(
                    &mut self.shader_modules,
                    ObjectType::ShaderModule,
                    cmd.result,
                    object,
                )
            }
            WireCmd::DeviceCreateCommandEncoder(cmd, _) => {
                let device = resolve(&self.devices, ObjectType::Device, cmd.device)?;
                let object = device.and_then(|device| {
                    created(
                        "command encoder",
                        self.backend.device_create_command_encoder(device),
                    )
                });
                mirror(
                    &mut self.command_encoders,
                    ObjectType::CommandEncoder,
                    cmd.result,
                    object,
                )
            }
            WireCmd::DeviceGetQueue(cmd, _) => {
                let device = resolve(&self.devices, ObjectType::Device, cmd.device)?;
                let object = device
                    .and_then(|device| created("queue", self.backend.device_get_queue(device)));
                mirror(&mut self.queues, ObjectType::Queue, cmd.result, object)
            }
            WireCmd::DevicePushErrorScope(cmd, _) => {
                let filter = ErrorFilter::from_u32(cmd.filter)
                    .map_err(|e| WireError::Validation(e.to_string()))?;
                if let Some(device) = resolve(&self.devices, ObjectType::Device, cmd.device)? {
                    self.backend.device_push_error_scope(device, filter);
                }
                Ok(())
            }
            WireCmd::DevicePopErrorScope(cmd, _) => {
                let done = Continuation::new(
                    cmd.device,
                    cmd.request_serial,
                    self.events.clone(),
                    |device, serial, result| Completion::PopErrorScope {
                        device,
                        serial,
                        result,
                    },
                );
                match resolve(&self.devices, ObjectType::Device, cmd.device)? {
                    Some(device) => self.backend.device_pop_error_scope(device, done),
                    None => done.fail(RequestStatus::Error),
                }
                Ok(())
            }
            WireCmd::DeviceDestroy(cmd, _) => {
                if let Some(device) = resolve(&self.devices, ObjectType::Device, cmd.device)? {
                    self.backend.device_destroy(device);
                }
                Ok(())
            }

            WireCmd::QueueSubmit(cmd, trailing) => {
                let queue = resolve(&self.queues, ObjectType::Queue, cmd.queue)?;
                let handles = decode_handles(trailing)?;
                let mut command_buffers = Vec::with_capacity(handles.len());
                let mut valid = true;
                for handle in handles {
                    match resolve(&self.command_buffers, ObjectType::CommandBuffer, handle)? {
                        Some(cb) => command_buffers.push(cb),
                        None => valid = false,
                    }
                }
                match queue {
                    Some(queue) if valid => {
                        checked("submit", self.backend.queue_submit(queue, &command_buffers));
                        Ok(())
                    }
                    _ => Err(WireError::Validation(
                        "submit references an error object".into(),
                    )),
                }
            }
            WireCmd::QueueWriteBuffer(cmd, data) => {
                let queue = resolve(&self.queues, ObjectType::Queue, cmd.queue)?;
                let buffer = resolve(&self.buffers, ObjectType::Buffer, cmd.buffer)?;
                if let (Some(queue), Some(buffer)) = (queue, buffer) {
                    checked(
                        "write_buffer",
                        self.backend
                            .queue_write_buffer(queue, buffer, cmd.buffer_offset, data),
                    );
                }
                Ok(())
            }
            WireCmd::QueueOnSubmittedWorkDone(cmd, _) => {
                let done = Continuation::new(
                    cmd.queue,
                    cmd.request_serial,
                    self.events.clone(),
                    |queue, serial, result| Completion::WorkDone {
                        queue,
                        serial,
                        result,
                    },
                );
                match resolve(&self.queues, ObjectType::Queue, cmd.queue)? {
                    Some(queue) => self.backend.queue_on_submitted_work_done(queue, done),
                    None => done.fail(RequestStatus::Error),
                }
                Ok(())
            }
            WireCmd::QueueCreateFence(cmd, _) => {
                let queue = resolve(&self.queues, ObjectType::Queue, cmd.queue)?;
                let object = queue.and_then(|queue| {
                    created(
                        "fence",
                        self.backend.queue_create_fence(queue, cmd.initial_value),
                    )
                });
                mirror(&mut self.fences, ObjectType::Fence, cmd.result, object)
            }
            WireCmd::QueueSignal(cmd, _) => {
                let queue = resolve(&self.queues, ObjectType::Queue, cmd.queue)?;
                let fence = resolve(&self.fences, ObjectType::Fence, cmd.fence)?;
                if let (Some(queue), Some(fence)) = (queue, fence) {
                    checked("signal", self.backend.queue_signal(queue, fence, cmd.value));
                }
                Ok(())
            }

            WireCmd::FenceOnCompletion(cmd, _) => {
                let done = Continuation::new(
                    cmd.fence,
                    cmd.request_serial,
                    self.events.clone(),
                    |fence, serial, result| Completion::FenceCompletion {
                        fence,
                        serial,
                        result,
                    },
                );
                match resolve(&self.fences, ObjectType::Fence, cmd.fence)? {
                    Some(fence) => self.backend.fence_on_completion(fence, cmd.value, done),
                    None => done.fail(RequestStatus::Error),
                }
                Ok(())
            }

            WireCmd::BufferMapAsync(cmd, _) => {
                let done = Continuation::new(
                    cmd.buffer,
                    cmd.request_serial,
                    self.events.clone(),
                    |buffer, serial, result| Completion::MapAsync {
                        buffer,
                        serial,
                        result,
                    },
                );
                let buffer = resolve(&self.buffers, ObjectType::Buffer, cmd.buffer)?;
                // Exactly one of READ or WRITE.
                let mode = MapMode::from_bits(cmd.mode)
                    .filter(|mode| *mode == MapMode::READ || *mode == MapMode::WRITE);
                match (buffer, mode) {
                    (Some(buffer), Some(mode)) => {
                        self.backend
                            .buffer_map_async(buffer, mode, cmd.offset, cmd.size, done)
                    }
                    _ => done.fail(RequestStatus::Error),
                }
                Ok(())
            }
            WireCmd::BufferUpdateMappedData(cmd, data) => {
                if let Some(buffer) = resolve(&self.buffers, ObjectType::Buffer, cmd.buffer)? {
                    checked(
                        "update mapped data",
                        self.backend.buffer_write_mapped(buffer, cmd.offset, data),
                    );
                }
                Ok(())
            }
            WireCmd::BufferUnmap(cmd, _) => {
                if let Some(buffer) = resolve(&self.buffers, ObjectType::Buffer, cmd.buffer)? {
                    checked("unmap", self.backend.buffer_unmap(buffer));
                }
                Ok(())
            }
            WireCmd::BufferDestroy(cmd, _) => {
                if let Some(buffer) = resolve(&self.buffers, ObjectType::Buffer, cmd.buffer)? {
                    self.backend.buffer_destroy(buffer);
                }
                Ok(())
            }

            WireCmd::ShaderModuleGetCompilationInfo(cmd, _) => {
                let done = Continuation::new(
                    cmd.shader_module,
                    cmd.request_serial,
                    self.events.clone(),
                    |shader_module, serial, result| Completion::CompilationInfo {
                        shader_module,
                        serial,
                        result,
                    },
                );
                match resolve(
                    &self.shader_modules,
                    ObjectType::ShaderModule,
                    cmd.shader_module,
                )? {
                    Some(module) => self.backend.shader_module_get_compilation_info(module, done),
                    None => done.fail(RequestStatus::Error),
                }
                Ok(())
            }

            WireCmd::CommandEncoderCopyBufferToBuffer(cmd, _) => {
                let encoder = resolve_mut(
                    &mut self.command_encoders,
                    ObjectType::CommandEncoder,
                    cmd.encoder,
                )?;
                let source = resolve(&self.buffers, ObjectType::Buffer, cmd.source)?;
                let destination = resolve(&self.buffers, ObjectType::Buffer, cmd.destination)?;
                if let (Some(encoder), Some(source), Some(destination)) =
                    (encoder, source, destination)
                {
                    checked(
                        "copy_buffer_to_buffer",
                        self.backend.command_encoder_copy_buffer_to_buffer(
                            encoder,
                            source,
                            cmd.source_offset,
                            destination,
                            cmd.destination_offset,
                            cmd.size,
                        ),
                    );
                }
                Ok(())
            }
            WireCmd::CommandEncoderFinish(cmd, _) => {
                let encoder = resolve_mut(
                    &mut self.command_encoders,
                    ObjectType::CommandEncoder,
                    cmd.encoder,
                )?;
                let object = encoder.and_then(|encoder| {
                    created(
                        "command buffer",
                        self.backend.command_encoder_finish(encoder),
                    )
                });
                mirror(
                    &mut self.command_buffers,
                    ObjectType::CommandBuffer,
                    cmd.result,
                    object,
                )
            }
        }
    }
}

/// Splits a completion result into the status to send and its payload,
/// substituting `empty` on failure.
fn split<T>(result: Result<T, RequestStatus>, empty: T) -> (RequestStatus, T) {
    match result {
        Ok(value) => (RequestStatus::Success, value),
        Err(status) => (status, empty),
    }
}

impl<B: Backend, S: CommandSerializer> CommandHandler for Server<B, S> {
    fn handle_commands(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        self.ensure_connected()?;
        let mut receiver = std::mem::take(&mut self.receiver);
        let result = receiver.handle_bytes(bytes, |header, body| self.dispatch(header, body));
        if !self.disconnected {
            self.receiver = receiver;
        }
        self.escalate(result)
    }
}
