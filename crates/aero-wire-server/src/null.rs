//! CPU-memory reference backend.
//!
//! Buffers are byte vectors and copies run when a command buffer is
//! submitted. Async work is queued and only completes on [`NullBackend::tick`],
//! which keeps in-flight requests observable from tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, CompilationMessage, CompilationMessageType, DeviceLostReason,
    ErrorFilter, ErrorType, MapMode, RequestStatus,
};
use tracing::debug;

use crate::backend::{Backend, BackendError, Continuation, DeviceEventSink};

struct ErrorScope {
    filter: ErrorFilter,
    error: Option<(ErrorType, String)>,
}

#[derive(Default)]
struct DeviceInner {
    sink: RefCell<Option<DeviceEventSink>>,
    scopes: RefCell<Vec<ErrorScope>>,
    lost: Cell<bool>,
}

#[derive(Clone, Default)]
pub struct NullDevice(Rc<DeviceInner>);

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_lost(&self) -> bool {
        self.0.lost.get()
    }

    /// Simulates losing the adapter. Reported once through the event sink.
    pub fn lose(&self, message: &str) {
        if self.0.lost.replace(true) {
            return;
        }
        if let Some(sink) = self.0.sink.borrow().as_ref() {
            sink.device_lost(DeviceLostReason::Unknown, message);
        }
    }

    /// Routes an error to the innermost matching scope, or to the sink.
    fn report(&self, kind: ErrorType, message: &str) {
        let mut scopes = self.0.scopes.borrow_mut();
        if let Some(scope) = scopes.iter_mut().rev().find(|s| s.filter.matches(kind)) {
            if scope.error.is_none() {
                scope.error = Some((kind, message.to_owned()));
            }
            return;
        }
        drop(scopes);
        match self.0.sink.borrow().as_ref() {
            Some(sink) => sink.uncaptured_error(kind, message),
            None => debug!(?kind, error = message, "device error with no sink"),
        }
    }

    fn validation(&self, message: String) -> BackendError {
        self.report(ErrorType::Validation, &message);
        BackendError::validation(message)
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.is_lost() {
            return Err(BackendError {
                kind: ErrorType::Unknown,
                message: "device is lost".into(),
            });
        }
        Ok(())
    }
}

pub struct NullQueue {
    device: NullDevice,
}

struct BufferInner {
    device: NullDevice,
    usage: BufferUsages,
    data: RefCell<Vec<u8>>,
    mapped: Cell<bool>,
    destroyed: Cell<bool>,
}

#[derive(Clone)]
pub struct NullBuffer(Rc<BufferInner>);

impl NullBuffer {
    /// Snapshot of the buffer's bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.0.data.borrow().clone()
    }

    pub fn is_mapped(&self) -> bool {
        self.0.mapped.get()
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    fn check_usable(&self, what: &str) -> Result<(), BackendError> {
        if self.is_destroyed() {
            return Err(self.0.device.validation(format!("{what} uses a destroyed buffer")));
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.0.data.borrow().len() as u64
    }

    fn range(&self, offset: u64, size: u64) -> Result<std::ops::Range<usize>, BackendError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size() => Ok(offset as usize..end as usize),
            _ => Err(self.0.device.validation(format!(
                "range {offset}+{size} exceeds buffer size {}",
                self.size()
            ))),
        }
    }
}

pub struct NullShaderModule {
    messages: Vec<CompilationMessage>,
}

struct CopyOp {
    source: NullBuffer,
    source_offset: u64,
    destination: NullBuffer,
    destination_offset: u64,
    size: u64,
}

pub struct NullCommandEncoder {
    device: NullDevice,
    copies: Vec<CopyOp>,
    finished: bool,
}

pub struct NullCommandBuffer {
    device: NullDevice,
    copies: RefCell<Vec<CopyOp>>,
    submitted: Cell<bool>,
}

struct FenceInner {
    value: Cell<u64>,
}

#[derive(Clone)]
pub struct NullFence(Rc<FenceInner>);

impl NullFence {
    pub fn value(&self) -> u64 {
        self.0.value.get()
    }
}

enum Deferred {
    WorkDone(Continuation<()>),
    Fence {
        fence: NullFence,
        value: u64,
        done: Continuation<u64>,
    },
    Map {
        buffer: NullBuffer,
        offset: u64,
        size: u64,
        done: Continuation<Vec<u8>>,
    },
    CompilationInfo {
        messages: Vec<CompilationMessage>,
        done: Continuation<Vec<CompilationMessage>>,
    },
    PopErrorScope {
        result: Result<(ErrorType, String), RequestStatus>,
        done: Continuation<(ErrorType, String)>,
    },
}

#[derive(Default)]
pub struct NullBackend {
    deferred: VecDeque<Deferred>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of async operations not yet completed.
    pub fn pending(&self) -> usize {
        self.deferred.len()
    }

    /// Fails every queued map of `buffer` with `status`.
    fn cancel_maps(&mut self, buffer: &NullBuffer, status: RequestStatus) {
        let mut kept = VecDeque::with_capacity(self.deferred.len());
        for op in self.deferred.drain(..) {
            match op {
                Deferred::Map {
                    buffer: queued,
                    done,
                    ..
                } if Rc::ptr_eq(&queued.0, &buffer.0) => {
                    debug!(buffer = %done.target(), ?status, "cancelling queued map");
                    done.fail(status);
                }
                other => kept.push_back(other),
            }
        }
        self.deferred = kept;
    }

    /// Runs every queued operation that can finish now. Fence waits whose
    /// value has not been reached stay queued.
    pub fn tick(&mut self) -> usize {
        let mut completed = 0;
        for op in std::mem::take(&mut self.deferred) {
            match op {
                Deferred::WorkDone(done) => done.complete(()),
                Deferred::Fence { fence, value, done } => {
                    if fence.value() < value {
                        self.deferred.push_back(Deferred::Fence { fence, value, done });
                        continue;
                    }
                    done.complete(fence.value());
                }
                Deferred::Map {
                    buffer,
                    offset,
                    size,
                    done,
                } => {
                    if buffer.0.device.is_lost() {
                        done.fail(RequestStatus::DeviceLost);
                        completed += 1;
                        continue;
                    }
                    if buffer.is_mapped() {
                        done.fail(RequestStatus::Error);
                        completed += 1;
                        continue;
                    }
                    let range = offset as usize..(offset + size) as usize;
                    let data = buffer.0.data.borrow()[range].to_vec();
                    buffer.0.mapped.set(true);
                    done.complete(data);
                }
                Deferred::CompilationInfo { messages, done } => done.complete(messages),
                Deferred::PopErrorScope { result, done } => match result {
                    Ok(value) => done.complete(value),
                    Err(status) => done.fail(status),
                },
            }
            completed += 1;
        }
        completed
    }
}

fn compile(wgsl: &str) -> Vec<CompilationMessage> {
    if wgsl.trim().is_empty() {
        return vec![CompilationMessage {
            kind: CompilationMessageType::Error,
            line_num: 1,
            line_pos: 1,
            message: "shader source is empty".into(),
        }];
    }
    if !["@vertex", "@fragment", "@compute"]
        .iter()
        .any(|stage| wgsl.contains(stage))
    {
        return vec![CompilationMessage {
            kind: CompilationMessageType::Warning,
            line_num: 1,
            line_pos: 1,
            message: "module declares no entry points".into(),
        }];
    }
    Vec::new()
}

impl Backend for NullBackend {
    type Device = NullDevice;
    type Queue = NullQueue;
    type Buffer = NullBuffer;
    type ShaderModule = NullShaderModule;
    type CommandEncoder = NullCommandEncoder;
    type CommandBuffer = NullCommandBuffer;
    type Fence = NullFence;

    fn device_set_event_sink(&mut self, device: &NullDevice, sink: DeviceEventSink) {
        *device.0.sink.borrow_mut() = Some(sink);
    }

    fn device_get_queue(&mut self, device: &NullDevice) -> Result<NullQueue, BackendError> {
        device.check_alive()?;
        Ok(NullQueue {
            device: device.clone(),
        })
    }

    fn device_create_buffer(
        &mut self,
        device: &NullDevice,
        desc: &BufferDescriptor,
    ) -> Result<NullBuffer, BackendError> {
        device.check_alive()?;
        if desc.usage.contains(BufferUsages::MAP_READ | BufferUsages::MAP_WRITE) {
            return Err(device.validation("MAP_READ and MAP_WRITE are mutually exclusive".into()));
        }
        if desc.mapped_at_creation && desc.size % 4 != 0 {
            return Err(device.validation(format!(
                "mapped_at_creation size {} is not a multiple of 4",
                desc.size
            )));
        }
        let len = usize::try_from(desc.size)
            .map_err(|_| device.validation(format!("buffer size {} is too large", desc.size)))?;
        let mut data = Vec::new();
        if data.try_reserve_exact(len).is_err() {
            let message = format!("cannot allocate {len} bytes");
            device.report(ErrorType::OutOfMemory, &message);
            return Err(BackendError {
                kind: ErrorType::OutOfMemory,
                message,
            });
        }
        data.resize(len, 0);
        Ok(NullBuffer(Rc::new(BufferInner {
            device: device.clone(),
            usage: desc.usage,
            data: RefCell::new(data),
            mapped: Cell::new(desc.mapped_at_creation),
            destroyed: Cell::new(false),
        })))
    }

    fn device_create_shader_module(
        &mut self,
        device: &NullDevice,
        wgsl: &str,
    ) -> Result<NullShaderModule, BackendError> {
        device.check_alive()?;
        let messages = compile(wgsl);
        if let Some(error) = messages
            .iter()
            .find(|m| m.kind == CompilationMessageType::Error)
        {
            device.report(ErrorType::Validation, &error.message);
        }
        Ok(NullShaderModule { messages })
    }

    fn device_create_command_encoder(
        &mut self,
        device: &NullDevice,
    ) -> Result<NullCommandEncoder, BackendError> {
        device.check_alive()?;
        Ok(NullCommandEncoder {
            device: device.clone(),
            copies: Vec::new(),
            finished: false,
        })
    }

    fn device_destroy(&mut self, device: &NullDevice) {
        // Set directly so the sink stays quiet.
        device.0.lost.set(true);
    }

    fn device_push_error_scope(&mut self, device: &NullDevice, filter: ErrorFilter) {
        device
            .0
            .scopes
            .borrow_mut()
            .push(ErrorScope { filter, error: None });
    }

    fn device_pop_error_scope(
        &mut self,
        device: &NullDevice,
        done: Continuation<(ErrorType, String)>,
    ) {
        let result = match device.0.scopes.borrow_mut().pop() {
            Some(scope) => Ok(scope
                .error
                .unwrap_or_else(|| (ErrorType::NoError, String::new()))),
            None => Err(RequestStatus::Error),
        };
        self.deferred
            .push_back(Deferred::PopErrorScope { result, done });
    }

    fn queue_submit(
        &mut self,
        queue: &NullQueue,
        command_buffers: &[&NullCommandBuffer],
    ) -> Result<(), BackendError> {
        queue.device.check_alive()?;
        // Nothing runs unless every command buffer and copy is valid.
        for (i, cb) in command_buffers.iter().enumerate() {
            if cb.submitted.get() || command_buffers[..i].iter().any(|o| std::ptr::eq(*o, *cb)) {
                return Err(queue
                    .device
                    .validation("command buffer was already submitted".into()));
            }
            if !Rc::ptr_eq(&cb.device.0, &queue.device.0) {
                return Err(queue
                    .device
                    .validation("command buffer belongs to another device".into()));
            }
            for copy in cb.copies.borrow().iter() {
                copy.source.check_usable("submitted copy")?;
                copy.destination.check_usable("submitted copy")?;
                if copy.source.is_mapped() || copy.destination.is_mapped() {
                    return Err(queue
                        .device
                        .validation("submitted copy uses a mapped buffer".into()));
                }
            }
        }
        for cb in command_buffers {
            cb.submitted.set(true);
            for copy in cb.copies.borrow_mut().drain(..) {
                let src = copy.source_offset as usize..(copy.source_offset + copy.size) as usize;
                let bytes = copy.source.0.data.borrow()[src].to_vec();
                let dst = copy.destination_offset as usize;
                copy.destination.0.data.borrow_mut()[dst..dst + bytes.len()]
                    .copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn queue_write_buffer(
        &mut self,
        queue: &NullQueue,
        buffer: &NullBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        queue.device.check_alive()?;
        if !buffer.0.usage.contains(BufferUsages::COPY_DST) {
            return Err(queue
                .device
                .validation("write_buffer target lacks COPY_DST".into()));
        }
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(queue
                .device
                .validation(format!("write of {} bytes at {offset} is not 4-byte aligned", data.len())));
        }
        buffer.check_usable("write_buffer")?;
        if buffer.is_mapped() {
            return Err(queue.device.validation("write_buffer target is mapped".into()));
        }
        let range = buffer.range(offset, data.len() as u64)?;
        buffer.0.data.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn queue_on_submitted_work_done(&mut self, _queue: &NullQueue, done: Continuation<()>) {
        self.deferred.push_back(Deferred::WorkDone(done));
    }

    fn queue_create_fence(
        &mut self,
        queue: &NullQueue,
        initial_value: u64,
    ) -> Result<NullFence, BackendError> {
        queue.device.check_alive()?;
        Ok(NullFence(Rc::new(FenceInner {
            value: Cell::new(initial_value),
        })))
    }

    fn queue_signal(
        &mut self,
        queue: &NullQueue,
        fence: &NullFence,
        value: u64,
    ) -> Result<(), BackendError> {
        queue.device.check_alive()?;
        if value < fence.value() {
            return Err(queue.device.validation(format!(
                "signal value {value} is below the fence's value {}",
                fence.value()
            )));
        }
        fence.0.value.set(value);
        Ok(())
    }

    fn fence_on_completion(&mut self, fence: &NullFence, value: u64, done: Continuation<u64>) {
        self.deferred.push_back(Deferred::Fence {
            fence: fence.clone(),
            value,
            done,
        });
    }

    fn buffer_map_async(
        &mut self,
        buffer: &NullBuffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        done: Continuation<Vec<u8>>,
    ) {
        let device = &buffer.0.device;
        let required = if mode == MapMode::WRITE {
            BufferUsages::MAP_WRITE
        } else {
            BufferUsages::MAP_READ
        };
        let error = if device.is_lost() {
            Some(RequestStatus::DeviceLost)
        } else if buffer.check_usable("map").is_err() {
            Some(RequestStatus::Error)
        } else if !buffer.0.usage.contains(required) {
            device.validation(format!("buffer usage lacks {required:?}"));
            Some(RequestStatus::Error)
        } else if buffer.is_mapped() {
            device.validation("buffer is already mapped".into());
            Some(RequestStatus::Error)
        } else if buffer.range(offset, size).is_err() {
            Some(RequestStatus::Error)
        } else {
            None
        };
        match error {
            Some(status) => done.fail(status),
            None => self.deferred.push_back(Deferred::Map {
                buffer: buffer.clone(),
                offset,
                size,
                done,
            }),
        }
    }

    fn buffer_write_mapped(
        &mut self,
        buffer: &NullBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        buffer.check_usable("mapped data")?;
        if !buffer.is_mapped() {
            return Err(buffer
                .0
                .device
                .validation("mapped data written to an unmapped buffer".into()));
        }
        let range = buffer.range(offset, data.len() as u64)?;
        buffer.0.data.borrow_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn buffer_unmap(&mut self, buffer: &NullBuffer) -> Result<(), BackendError> {
        self.cancel_maps(buffer, RequestStatus::UnmappedBeforeCallback);
        buffer.0.mapped.set(false);
        Ok(())
    }

    fn buffer_destroy(&mut self, buffer: &NullBuffer) {
        self.cancel_maps(buffer, RequestStatus::DestroyedBeforeCallback);
        buffer.0.destroyed.set(true);
        buffer.0.mapped.set(false);
        *buffer.0.data.borrow_mut() = Vec::new();
    }

    fn shader_module_get_compilation_info(
        &mut self,
        shader_module: &NullShaderModule,
        done: Continuation<Vec<CompilationMessage>>,
    ) {
        self.deferred.push_back(Deferred::CompilationInfo {
            messages: shader_module.messages.clone(),
            done,
        });
    }

    fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: &mut NullCommandEncoder,
        source: &NullBuffer,
        source_offset: u64,
        destination: &NullBuffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let device = &encoder.device;
        if encoder.finished {
            return Err(device.validation("encoder is already finished".into()));
        }
        if !source.0.usage.contains(BufferUsages::COPY_SRC) {
            return Err(device.validation("copy source lacks COPY_SRC".into()));
        }
        if !destination.0.usage.contains(BufferUsages::COPY_DST) {
            return Err(device.validation("copy destination lacks COPY_DST".into()));
        }
        source.check_usable("copy_buffer_to_buffer")?;
        destination.check_usable("copy_buffer_to_buffer")?;
        if Rc::ptr_eq(&source.0, &destination.0) {
            return Err(device.validation("copy source and destination are the same buffer".into()));
        }
        if source_offset % 4 != 0 || destination_offset % 4 != 0 || size % 4 != 0 {
            return Err(device.validation("copy offsets and size must be multiples of 4".into()));
        }
        source.range(source_offset, size)?;
        destination.range(destination_offset, size)?;
        encoder.copies.push(CopyOp {
            source: source.clone(),
            source_offset,
            destination: destination.clone(),
            destination_offset,
            size,
        });
        Ok(())
    }

    fn command_encoder_finish(
        &mut self,
        encoder: &mut NullCommandEncoder,
    ) -> Result<NullCommandBuffer, BackendError> {
        if std::mem::replace(&mut encoder.finished, true) {
            return Err(encoder
                .device
                .validation("encoder is already finished".into()));
        }
        Ok(NullCommandBuffer {
            device: encoder.device.clone(),
            copies: RefCell::new(std::mem::take(&mut encoder.copies)),
            submitted: Cell::new(false),
        })
    }

    fn poll(&mut self) -> usize {
        self.tick()
    }
}
