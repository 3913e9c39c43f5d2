use aero_wire_protocol::cmd::{
    DeviceCreateBuffer, DeviceCreateCommandEncoder, DeviceCreateShaderModule, DeviceGetQueue,
    DeviceDestroy, DevicePopErrorScope, DevicePushErrorScope,
};
use aero_wire_protocol::{
    BufferDescriptor, CommandSerializer, DeviceLostReason, ErrorFilter, ErrorType, ObjectType,
    RequestStatus, WireError,
};

use crate::client::{live, live_mut, Client};
use crate::objects::{Buffer, CommandEncoder, Device, Queue, ShaderModule, WireObject};
use crate::requests::{resolve_all, BufferState, MapState, PendingRequest, Proxy};

impl<S: CommandSerializer> Client<S> {
    pub fn device_get_queue(&mut self, device: Device) -> Result<Queue, WireError> {
        self.ensure_connected()?;
        live(&self.devices, ObjectType::Device, device.handle())?;
        let result = self.queues.allocate(Proxy::new(device.handle(), ()));
        self.serialize(
            &DeviceGetQueue {
                device: device.handle(),
                result,
            },
            &[],
        )?;
        Ok(Queue::from_handle(result))
    }

    /// Creates a buffer. With `mapped_at_creation` the whole buffer starts
    /// out write-mapped in client memory.
    pub fn device_create_buffer(
        &mut self,
        device: Device,
        desc: &BufferDescriptor,
    ) -> Result<Buffer, WireError> {
        self.ensure_connected()?;
        live(&self.devices, ObjectType::Device, device.handle())?;

        let map_state = if desc.mapped_at_creation {
            if desc.size % 4 != 0 {
                return Err(WireError::Validation(format!(
                    "mapped_at_creation buffer size {} is not a multiple of 4",
                    desc.size
                )));
            }
            let len = usize::try_from(desc.size).map_err(|_| {
                WireError::Validation(format!("buffer size {} does not fit in memory", desc.size))
            })?;
            let mut data = Vec::new();
            data.try_reserve_exact(len).map_err(|_| {
                WireError::Validation(format!("cannot allocate {len} bytes of mapped memory"))
            })?;
            data.resize(len, 0);
            MapState::Mapped {
                mode: aero_wire_protocol::MapMode::WRITE,
                offset: 0,
                data,
            }
        } else {
            MapState::Unmapped
        };

        let result = self.buffers.allocate(Proxy::new(
            device.handle(),
            BufferState::new(desc.size, desc.usage, map_state),
        ));
        self.serialize(
            &DeviceCreateBuffer {
                device: device.handle(),
                result,
                size: desc.size,
                usage: desc.usage.bits(),
                mapped_at_creation: desc.mapped_at_creation,
            },
            &[],
        )?;
        Ok(Buffer::from_handle(result))
    }

    pub fn device_create_shader_module(
        &mut self,
        device: Device,
        wgsl: &str,
    ) -> Result<ShaderModule, WireError> {
        self.ensure_connected()?;
        live(&self.devices, ObjectType::Device, device.handle())?;
        let result = self
            .shader_modules
            .allocate(Proxy::new(device.handle(), ()));
        self.serialize(
            &DeviceCreateShaderModule {
                device: device.handle(),
                result,
                code_len: wgsl.len() as u64,
            },
            wgsl.as_bytes(),
        )?;
        Ok(ShaderModule::from_handle(result))
    }

    pub fn device_create_command_encoder(
        &mut self,
        device: Device,
    ) -> Result<CommandEncoder, WireError> {
        self.ensure_connected()?;
        live(&self.devices, ObjectType::Device, device.handle())?;
        let result = self
            .command_encoders
            .allocate(Proxy::new(device.handle(), ()));
        self.serialize(
            &DeviceCreateCommandEncoder {
                device: device.handle(),
                result,
            },
            &[],
        )?;
        Ok(CommandEncoder::from_handle(result))
    }

    pub fn device_push_error_scope(
        &mut self,
        device: Device,
        filter: ErrorFilter,
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        live(&self.devices, ObjectType::Device, device.handle())?;
        self.serialize(
            &DevicePushErrorScope {
                device: device.handle(),
                filter: filter.to_u32(),
            },
            &[],
        )
    }

    /// Pops the innermost error scope. `callback` receives the captured
    /// error, or [`ErrorType::NoError`].
    pub fn device_pop_error_scope(
        &mut self,
        device: Device,
        callback: impl FnOnce(RequestStatus, ErrorType, &str) + 'static,
    ) -> Result<(), WireError> {
        if self.is_disconnected() {
            callback(RequestStatus::Disconnected, ErrorType::Unknown, "");
            return Ok(());
        }
        let Some(proxy) = self.devices.get_mut(device.handle()) else {
            callback(RequestStatus::Error, ErrorType::Unknown, "device is not alive");
            return Ok(());
        };
        let request_serial = proxy
            .requests
            .issue(PendingRequest::PopErrorScope(Box::new(callback)));
        self.serialize(
            &DevicePopErrorScope {
                device: device.handle(),
                request_serial,
            },
            &[],
        )
    }

    /// Destroys the device but keeps its handle until the last release.
    ///
    /// Every buffer created from it is destroyed as by
    /// [`Client::buffer_destroy`], and the device-lost callback fires with
    /// [`DeviceLostReason::Destroyed`]. Other pending requests are still
    /// answered by the server.
    pub fn device_destroy(&mut self, device: Device) -> Result<(), WireError> {
        self.ensure_connected()?;
        let handle = device.handle();
        let lost_callback = live_mut(&mut self.devices, ObjectType::Device, handle)?
            .inner
            .lost_callback
            .take();

        let mut cancelled = Vec::new();
        for (_, proxy) in self.buffers.iter_mut() {
            if proxy.device != handle {
                continue;
            }
            if let Some(serial) = proxy.inner.destroy() {
                cancelled.extend(proxy.requests.take(serial));
            }
        }

        let result = self.serialize(&DeviceDestroy { device: handle }, &[]);
        resolve_all(cancelled, RequestStatus::DestroyedBeforeCallback);
        if let Some(callback) = lost_callback {
            callback(DeviceLostReason::Destroyed, "device destroyed");
        }
        result
    }

    /// Installs the callback for errors no error scope captured. Replaces any
    /// previous one.
    pub fn device_set_uncaptured_error_callback(
        &mut self,
        device: Device,
        callback: impl FnMut(ErrorType, &str) + 'static,
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        let proxy = live_mut(&mut self.devices, ObjectType::Device, device.handle())?;
        proxy.inner.uncaptured_error_callback = Some(Box::new(callback));
        Ok(())
    }

    /// Installs the device-lost callback. It fires at most once: when the
    /// server reports the loss, when the device is destroyed, or when the
    /// connection drops.
    pub fn device_set_device_lost_callback(
        &mut self,
        device: Device,
        callback: impl FnOnce(DeviceLostReason, &str) + 'static,
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        let proxy = live_mut(&mut self.devices, ObjectType::Device, device.handle())?;
        proxy.inner.lost_callback = Some(Box::new(callback));
        Ok(())
    }
}
