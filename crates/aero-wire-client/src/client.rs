use aero_wire_protocol::cmd::DestroyObject;
use aero_wire_protocol::{
    ChunkedCommandHandler, ChunkedCommandSerializer, CmdHeader, CommandHandler, CommandSerializer,
    DeviceLostReason, Lookup, ObjectHandle, ObjectTable, ObjectType, RequestStatus, ReturnWireCmd,
    WireCommand, WireError,
};
use tracing::{debug, trace, warn};

use crate::objects::{Device, WireObject, CASCADE_ORDER};
use crate::requests::{
    resolve_all, BufferState, DeviceState, FenceState, MapState, PendingRequest, Proxy,
};

/// Runs `$body` with `$table` bound to the client table for `$ty`.
macro_rules! with_table {
    ($client:expr, $ty:expr, |$table:ident| $body:expr) => {
        match $ty {
            ObjectType::Device => {
                let $table = &mut $client.devices;
                $body
            }
            ObjectType::Queue => {
                let $table = &mut $client.queues;
                $body
            }
            ObjectType::Buffer => {
                let $table = &mut $client.buffers;
                $body
            }
            ObjectType::ShaderModule => {
                let $table = &mut $client.shader_modules;
                $body
            }
            ObjectType::CommandEncoder => {
                let $table = &mut $client.command_encoders;
                $body
            }
            ObjectType::CommandBuffer => {
                let $table = &mut $client.command_buffers;
                $body
            }
            ObjectType::Fence => {
                let $table = &mut $client.fences;
                $body
            }
        }
    };
}

/// Client half of a wire connection.
///
/// Every API call is turned into a command on `S`; return commands fed in
/// through [`CommandHandler::handle_commands`] resolve pending requests.
/// Once disconnected the client stays disconnected: sync calls fail with
/// [`WireError::Disconnected`] and async calls resolve their callback with
/// [`RequestStatus::Disconnected`] before returning.
pub struct Client<S> {
    serializer: ChunkedCommandSerializer<S>,
    receiver: ChunkedCommandHandler,
    disconnected: bool,

    pub(crate) devices: ObjectTable<Proxy<DeviceState>>,
    pub(crate) queues: ObjectTable<Proxy<()>>,
    pub(crate) buffers: ObjectTable<Proxy<BufferState>>,
    pub(crate) shader_modules: ObjectTable<Proxy<()>>,
    pub(crate) command_encoders: ObjectTable<Proxy<()>>,
    pub(crate) command_buffers: ObjectTable<Proxy<()>>,
    pub(crate) fences: ObjectTable<Proxy<FenceState>>,
}

pub(crate) fn not_alive(object_type: ObjectType, handle: ObjectHandle) -> WireError {
    WireError::Validation(format!("{object_type:?} {handle} is not alive"))
}

/// Looks up a live proxy for a user-supplied handle.
pub(crate) fn live<T>(
    table: &ObjectTable<Proxy<T>>,
    object_type: ObjectType,
    handle: ObjectHandle,
) -> Result<&Proxy<T>, WireError> {
    table.get(handle).ok_or_else(|| not_alive(object_type, handle))
}

pub(crate) fn live_mut<T>(
    table: &mut ObjectTable<Proxy<T>>,
    object_type: ObjectType,
    handle: ObjectHandle,
) -> Result<&mut Proxy<T>, WireError> {
    table.get_mut(handle).ok_or_else(|| not_alive(object_type, handle))
}

/// Looks up the target of a return command. Stale targets yield `None`;
/// handles the client never issued are a protocol violation.
fn return_target<T>(
    table: &mut ObjectTable<Proxy<T>>,
    object_type: ObjectType,
    handle: ObjectHandle,
) -> Result<Option<&mut Proxy<T>>, WireError> {
    match table.lookup_mut(handle) {
        Lookup::Live(proxy) => Ok(Some(proxy)),
        Lookup::Stale => {
            debug!(?object_type, %handle, "ignoring return command for destroyed object");
            Ok(None)
        }
        Lookup::Unknown => Err(WireError::UnknownObject {
            object_type,
            handle,
        }),
    }
}

fn drain_requests<T>(table: &mut ObjectTable<Proxy<T>>, out: &mut Vec<PendingRequest>) {
    for (_, proxy) in table.iter_mut() {
        out.extend(proxy.requests.drain());
    }
}

impl<S: CommandSerializer> Client<S> {
    pub fn new(serializer: S) -> Self {
        Self {
            serializer: ChunkedCommandSerializer::new(serializer),
            receiver: ChunkedCommandHandler::new(),
            disconnected: false,
            devices: ObjectTable::new(),
            queues: ObjectTable::new(),
            buffers: ObjectTable::new(),
            shader_modules: ObjectTable::new(),
            command_encoders: ObjectTable::new(),
            command_buffers: ObjectTable::new(),
            fences: ObjectTable::new(),
        }
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

    pub(crate) fn ensure_connected(&self) -> Result<(), WireError> {
        if self.disconnected {
            Err(WireError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Whether `object` currently names a live client object.
    pub fn is_alive<O: WireObject>(&self, object: O) -> bool {
        let handle = object.handle();
        match O::TYPE {
            ObjectType::Device => self.devices.contains(handle),
            ObjectType::Queue => self.queues.contains(handle),
            ObjectType::Buffer => self.buffers.contains(handle),
            ObjectType::ShaderModule => self.shader_modules.contains(handle),
            ObjectType::CommandEncoder => self.command_encoders.contains(handle),
            ObjectType::CommandBuffer => self.command_buffers.contains(handle),
            ObjectType::Fence => self.fences.contains(handle),
        }
    }

    /// Number of requests still waiting on `object`.
    pub fn pending_request_count<O: WireObject>(&self, object: O) -> usize {
        let handle = object.handle();
        let count = |requests: Option<&crate::requests::PendingRequests>| {
            requests.map_or(0, |r| r.len())
        };
        match O::TYPE {
            ObjectType::Device => count(self.devices.get(handle).map(|p| &p.requests)),
            ObjectType::Queue => count(self.queues.get(handle).map(|p| &p.requests)),
            ObjectType::Buffer => count(self.buffers.get(handle).map(|p| &p.requests)),
            ObjectType::ShaderModule => count(self.shader_modules.get(handle).map(|p| &p.requests)),
            ObjectType::CommandEncoder => {
                count(self.command_encoders.get(handle).map(|p| &p.requests))
            }
            ObjectType::CommandBuffer => {
                count(self.command_buffers.get(handle).map(|p| &p.requests))
            }
            ObjectType::Fence => count(self.fences.get(handle).map(|p| &p.requests)),
        }
    }

    /// Serializes one command. A fatal failure disconnects the client.
    pub(crate) fn serialize<C: WireCommand>(
        &mut self,
        cmd: &C,
        trailing: &[u8],
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        let result = self.serializer.serialize(cmd, trailing);
        self.escalate(result)
    }

    pub fn flush(&mut self) -> Result<(), WireError> {
        self.ensure_connected()?;
        let result = self.serializer.flush();
        self.escalate(result)
    }

    fn escalate<T>(&mut self, result: Result<T, WireError>) -> Result<T, WireError> {
        if let Err(err) = &result {
            if err.is_fatal() {
                warn!(%err, "fatal wire error on client");
                self.disconnect();
            }
        }
        result
    }

    /// Tears the connection down. Idempotent.
    ///
    /// Every pending request is resolved with [`RequestStatus::Disconnected`]
    /// and device-lost callbacks fire with [`DeviceLostReason::ConnectionLost`].
    /// Objects stay in their tables.
    pub fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.receiver.reset();
        warn!("wire client disconnected");

        let mut cancelled = Vec::new();
        drain_requests(&mut self.devices, &mut cancelled);
        drain_requests(&mut self.queues, &mut cancelled);
        drain_requests(&mut self.buffers, &mut cancelled);
        drain_requests(&mut self.shader_modules, &mut cancelled);
        drain_requests(&mut self.command_encoders, &mut cancelled);
        drain_requests(&mut self.command_buffers, &mut cancelled);
        drain_requests(&mut self.fences, &mut cancelled);
        for (_, proxy) in self.buffers.iter_mut() {
            if matches!(proxy.inner.map_state, MapState::Pending { .. }) {
                proxy.inner.map_state = MapState::Unmapped;
            }
        }
        let lost: Vec<_> = self
            .devices
            .iter_mut()
            .filter_map(|(_, proxy)| proxy.inner.lost_callback.take())
            .collect();

        resolve_all(cancelled, RequestStatus::Disconnected);
        for callback in lost {
            callback(DeviceLostReason::ConnectionLost, "wire connection lost");
        }
    }

    /// Allocates the client half of a device. The server binds the same
    /// handle to a backend device out of band.
    pub fn reserve_device(&mut self) -> Result<Device, WireError> {
        self.ensure_connected()?;
        let handle = self
            .devices
            .allocate(Proxy::new(ObjectHandle::NULL, DeviceState::default()));
        Ok(Device::from_handle(handle))
    }

    pub fn reference<O: WireObject>(&mut self, object: O) -> Result<(), WireError> {
        self.ensure_connected()?;
        let handle = object.handle();
        with_table!(self, O::TYPE, |table| {
            let proxy = live_mut(table, O::TYPE, handle)?;
            proxy.refcount += 1;
        });
        Ok(())
    }

    /// Drops one reference. The last release destroys the object, resolving
    /// its pending requests with [`RequestStatus::DestroyedBeforeCallback`];
    /// for a device it destroys every child first.
    pub fn release<O: WireObject>(&mut self, object: O) -> Result<(), WireError> {
        self.ensure_connected()?;
        let handle = object.handle();
        let last = with_table!(self, O::TYPE, |table| {
            let proxy = live_mut(table, O::TYPE, handle)?;
            proxy.refcount -= 1;
            proxy.refcount == 0
        });
        if !last {
            return Ok(());
        }
        if O::TYPE == ObjectType::Device {
            return self.release_device_tree(handle);
        }

        let cancelled = with_table!(self, O::TYPE, |table| {
            let mut proxy = table
                .free(handle)
                .map_err(|e| WireError::table(O::TYPE, e))?;
            proxy.requests.drain()
        });
        let result = self.serialize(
            &DestroyObject {
                object_type: O::TYPE.to_u32(),
                handle,
            },
            &[],
        );
        resolve_all(cancelled, RequestStatus::DestroyedBeforeCallback);
        result
    }

    fn release_device_tree(&mut self, device: ObjectHandle) -> Result<(), WireError> {
        let mut lost_requests = Vec::new();
        let mut destroyed = Vec::new();

        for object_type in CASCADE_ORDER {
            with_table!(self, object_type, |table| {
                for handle in table.handles_where(|proxy| proxy.device == device) {
                    let mut proxy = table
                        .free(handle)
                        .map_err(|e| WireError::table(object_type, e))?;
                    lost_requests.extend(proxy.requests.drain());
                    destroyed.push((object_type, handle));
                }
            });
        }

        let mut proxy = self
            .devices
            .free(device)
            .map_err(|e| WireError::table(ObjectType::Device, e))?;
        let own_requests = proxy.requests.drain();
        destroyed.push((ObjectType::Device, device));
        debug!(%device, objects = destroyed.len(), "destroying device tree");

        let mut result = Ok(());
        for (object_type, handle) in destroyed {
            let cmd = DestroyObject {
                object_type: object_type.to_u32(),
                handle,
            };
            if let Err(err) = self.serialize(&cmd, &[]) {
                result = Err(err);
                break;
            }
        }

        resolve_all(lost_requests, RequestStatus::DeviceLost);
        resolve_all(own_requests, RequestStatus::DestroyedBeforeCallback);
        if let Some(callback) = proxy.inner.lost_callback.take() {
            callback(DeviceLostReason::Destroyed, "device destroyed");
        }
        result
    }

    fn dispatch(&mut self, header: CmdHeader, body: &[u8]) -> Result<(), WireError> {
        let cmd = ReturnWireCmd::decode(header.command_id, body)?;
        trace!(command = cmd.name(), "client dispatch");
        match cmd {
            ReturnWireCmd::BufferMapAsyncCallback(cmd, data) => {
                let status = RequestStatus::from_u32(cmd.status)?;
                let Some(proxy) = return_target(&mut self.buffers, ObjectType::Buffer, cmd.buffer)?
                else {
                    return Ok(());
                };
                crate::buffer::on_map_async_callback(proxy, cmd.request_serial, status, data)
            }
            ReturnWireCmd::ShaderModuleGetCompilationInfoCallback(cmd, info) => {
                let status = RequestStatus::from_u32(cmd.status)?;
                let messages = if status == RequestStatus::Success {
                    aero_wire_protocol::types::decode_compilation_messages(info)?
                } else {
                    Vec::new()
                };
                let Some(proxy) = return_target(
                    &mut self.shader_modules,
                    ObjectType::ShaderModule,
                    cmd.shader_module,
                )?
                else {
                    return Ok(());
                };
                match proxy.requests.take(cmd.request_serial) {
                    Some(PendingRequest::CompilationInfo(cb)) => cb(status, &messages),
                    Some(other) => other.resolve(status),
                    None => debug!(serial = cmd.request_serial, "compilation info already resolved"),
                }
                Ok(())
            }
            ReturnWireCmd::QueueWorkDoneCallback(cmd, _) => {
                let status = RequestStatus::from_u32(cmd.status)?;
                let Some(proxy) = return_target(&mut self.queues, ObjectType::Queue, cmd.queue)?
                else {
                    return Ok(());
                };
                match proxy.requests.take(cmd.request_serial) {
                    Some(request) => request.resolve(status),
                    None => debug!(serial = cmd.request_serial, "work done already resolved"),
                }
                Ok(())
            }
            ReturnWireCmd::FenceOnCompletionCallback(cmd, _) => {
                let status = RequestStatus::from_u32(cmd.status)?;
                let Some(proxy) = return_target(&mut self.fences, ObjectType::Fence, cmd.fence)?
                else {
                    return Ok(());
                };
                if status == RequestStatus::Success {
                    let completed = &mut proxy.inner.completed_value;
                    *completed = (*completed).max(cmd.completed_value);
                }
                match proxy.requests.take(cmd.request_serial) {
                    Some(request) => request.resolve(status),
                    None => debug!(serial = cmd.request_serial, "fence completion already resolved"),
                }
                Ok(())
            }
            ReturnWireCmd::DevicePopErrorScopeCallback(cmd, message) => {
                let status = RequestStatus::from_u32(cmd.status)?;
                let error_type = aero_wire_protocol::ErrorType::from_u32(cmd.error_type)?;
                let message = utf8(message)?;
                let Some(proxy) = return_target(&mut self.devices, ObjectType::Device, cmd.device)?
                else {
                    return Ok(());
                };
                match proxy.requests.take(cmd.request_serial) {
                    Some(PendingRequest::PopErrorScope(cb)) => cb(status, error_type, message),
                    Some(other) => other.resolve(status),
                    None => debug!(serial = cmd.request_serial, "error scope already resolved"),
                }
                Ok(())
            }
            ReturnWireCmd::DeviceUncapturedErrorCallback(cmd, message) => {
                let error_type = aero_wire_protocol::ErrorType::from_u32(cmd.error_type)?;
                let message = utf8(message)?;
                let Some(proxy) = return_target(&mut self.devices, ObjectType::Device, cmd.device)?
                else {
                    return Ok(());
                };
                match proxy.inner.uncaptured_error_callback.as_mut() {
                    Some(cb) => cb(error_type, message),
                    None => debug!(?error_type, error = message, "uncaptured device error"),
                }
                Ok(())
            }
            ReturnWireCmd::DeviceLostCallback(cmd, message) => {
                let reason = DeviceLostReason::from_u32(cmd.reason)?;
                let message = utf8(message)?;
                let Some(proxy) = return_target(&mut self.devices, ObjectType::Device, cmd.device)?
                else {
                    return Ok(());
                };
                if let Some(cb) = proxy.inner.lost_callback.take() {
                    cb(reason, message);
                }
                Ok(())
            }
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, WireError> {
    core::str::from_utf8(bytes).map_err(|_| aero_wire_protocol::DecodeError::InvalidUtf8.into())
}

impl<S: CommandSerializer> CommandHandler for Client<S> {
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
