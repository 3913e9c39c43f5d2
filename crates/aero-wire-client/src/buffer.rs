//! Buffer mapping.
//!
//! A map request moves a buffer from `Unmapped` to `Pending`; the server's
//! reply either lands the bytes in client memory (`Mapped`) or drops back to
//! `Unmapped`. Writes to a write-mapped range go back to the server when the
//! buffer is unmapped.

use aero_wire_protocol::cmd::{BufferDestroy, BufferMapAsync, BufferUnmap, BufferUpdateMappedData};
use aero_wire_protocol::{
    BufferUsages, CommandSerializer, MapMode, ObjectType, RequestStatus, WireError,
};
use tracing::debug;

use crate::client::{live, live_mut, Client};
use crate::objects::{Buffer, WireObject};
use crate::requests::{BufferMapState, BufferState, MapState, PendingRequest, Proxy};

/// Applies a `BufferMapAsyncCallback` to a live buffer.
pub(crate) fn on_map_async_callback(
    proxy: &mut Proxy<BufferState>,
    serial: u64,
    status: RequestStatus,
    data: &[u8],
) -> Result<(), WireError> {
    let Some(request) = proxy.requests.take(serial) else {
        debug!(serial, "map request already resolved");
        return Ok(());
    };

    // An unmap may have cancelled this request and a newer one may be pending;
    // only the matching request owns the state.
    let pending = match proxy.inner.map_state {
        MapState::Pending {
            serial: pending_serial,
            mode,
            offset,
            size,
        } if pending_serial == serial => Some((mode, offset, size)),
        _ => None,
    };

    match (status, pending) {
        (RequestStatus::Success, Some((mode, offset, size))) => {
            if data.len() as u64 != size {
                // The error disconnects the client; this request has already
                // left the table, so resolve it here.
                proxy.inner.map_state = MapState::Unmapped;
                request.resolve(RequestStatus::Disconnected);
                return Err(WireError::TrailingLength {
                    declared: size,
                    actual: data.len(),
                });
            }
            proxy.inner.map_state = MapState::Mapped {
                mode,
                offset,
                data: data.to_vec(),
            };
        }
        (_, Some(_)) => proxy.inner.map_state = MapState::Unmapped,
        (_, None) => {}
    }
    request.resolve(status);
    Ok(())
}

fn validate_map(
    state: &BufferState,
    mode: MapMode,
    offset: u64,
    size: u64,
) -> Result<(), String> {
    if state.destroyed {
        return Err("buffer is destroyed".into());
    }
    if !matches!(state.map_state, MapState::Unmapped) {
        return Err("buffer is already mapped or has a map pending".into());
    }
    let required = if mode == MapMode::READ {
        BufferUsages::MAP_READ
    } else if mode == MapMode::WRITE {
        BufferUsages::MAP_WRITE
    } else {
        return Err(format!("map mode {mode:?} must be exactly READ or WRITE"));
    };
    if !state.usage.contains(required) {
        return Err(format!("buffer usage {:?} lacks {required:?}", state.usage));
    }
    if offset % 8 != 0 {
        return Err(format!("map offset {offset} is not a multiple of 8"));
    }
    if size % 4 != 0 {
        return Err(format!("map size {size} is not a multiple of 4"));
    }
    match offset.checked_add(size) {
        Some(end) if end <= state.size => Ok(()),
        _ => Err(format!(
            "map range {offset}+{size} exceeds buffer size {}",
            state.size
        )),
    }
}

impl<S: CommandSerializer> Client<S> {
    /// Requests a mapping of `offset..offset + size`. The callback receives
    /// [`RequestStatus::Error`] if the request is invalid for the buffer's
    /// current state.
    pub fn buffer_map_async(
        &mut self,
        buffer: Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: impl FnOnce(RequestStatus) + 'static,
    ) -> Result<(), WireError> {
        if self.is_disconnected() {
            callback(RequestStatus::Disconnected);
            return Ok(());
        }
        let Some(proxy) = self.buffers.get_mut(buffer.handle()) else {
            debug!(buffer = %buffer.handle(), "map of dead buffer");
            callback(RequestStatus::Error);
            return Ok(());
        };
        if let Err(reason) = validate_map(&proxy.inner, mode, offset, size) {
            debug!(buffer = %buffer.handle(), %reason, "rejecting map request");
            callback(RequestStatus::Error);
            return Ok(());
        }

        let request_serial = proxy
            .requests
            .issue(PendingRequest::MapAsync(Box::new(callback)));
        proxy.inner.map_state = MapState::Pending {
            serial: request_serial,
            mode,
            offset,
            size,
        };
        self.serialize(
            &BufferMapAsync {
                buffer: buffer.handle(),
                request_serial,
                mode: mode.bits(),
                offset,
                size,
            },
            &[],
        )
    }

    /// Bytes of the currently mapped range.
    pub fn buffer_get_mapped_range(&self, buffer: Buffer) -> Result<&[u8], WireError> {
        match &live(&self.buffers, ObjectType::Buffer, buffer.handle())?
            .inner
            .map_state
        {
            MapState::Mapped { data, .. } => Ok(data.as_slice()),
            _ => Err(WireError::Validation(format!(
                "buffer {} is not mapped",
                buffer.handle()
            ))),
        }
    }

    /// Writable view of a write-mapped range.
    pub fn buffer_get_mapped_range_mut(&mut self, buffer: Buffer) -> Result<&mut [u8], WireError> {
        match &mut live_mut(&mut self.buffers, ObjectType::Buffer, buffer.handle())?
            .inner
            .map_state
        {
            MapState::Mapped { mode, data, .. } if mode.contains(MapMode::WRITE) => {
                Ok(data.as_mut_slice())
            }
            _ => Err(WireError::Validation(format!(
                "buffer {} is not mapped for writing",
                buffer.handle()
            ))),
        }
    }

    /// Ends a mapping. A pending map resolves with
    /// [`RequestStatus::UnmappedBeforeCallback`]; a write mapping sends its
    /// contents back first.
    pub fn buffer_unmap(&mut self, buffer: Buffer) -> Result<(), WireError> {
        self.ensure_connected()?;
        let proxy = live_mut(&mut self.buffers, ObjectType::Buffer, buffer.handle())?;

        let mut cancelled = None;
        let mut write_back = None;
        match std::mem::replace(&mut proxy.inner.map_state, MapState::Unmapped) {
            MapState::Unmapped => {}
            MapState::Pending { serial, .. } => cancelled = proxy.requests.take(serial),
            MapState::Mapped { mode, offset, data } => {
                if mode.contains(MapMode::WRITE) {
                    write_back = Some((offset, data));
                }
            }
        }

        let mut result = Ok(());
        if let Some((offset, data)) = write_back {
            result = self.serialize(
                &BufferUpdateMappedData {
                    buffer: buffer.handle(),
                    offset,
                    data_len: data.len() as u64,
                },
                &data,
            );
        }
        if result.is_ok() {
            result = self.serialize(
                &BufferUnmap {
                    buffer: buffer.handle(),
                },
                &[],
            );
        }
        if let Some(request) = cancelled {
            request.resolve(RequestStatus::UnmappedBeforeCallback);
        }
        result
    }

    /// Destroys the buffer but keeps its handle until the last release. A
    /// pending map resolves with [`RequestStatus::DestroyedBeforeCallback`]
    /// and mapped memory is dropped without being written back. Later map
    /// requests fail.
    pub fn buffer_destroy(&mut self, buffer: Buffer) -> Result<(), WireError> {
        self.ensure_connected()?;
        let proxy = live_mut(&mut self.buffers, ObjectType::Buffer, buffer.handle())?;
        let cancelled = proxy
            .inner
            .destroy()
            .and_then(|serial| proxy.requests.take(serial));
        let result = self.serialize(
            &BufferDestroy {
                buffer: buffer.handle(),
            },
            &[],
        );
        if let Some(request) = cancelled {
            request.resolve(RequestStatus::DestroyedBeforeCallback);
        }
        result
    }

    pub fn buffer_size(&self, buffer: Buffer) -> Result<u64, WireError> {
        Ok(live(&self.buffers, ObjectType::Buffer, buffer.handle())?.inner.size)
    }

    pub fn buffer_usage(&self, buffer: Buffer) -> Result<BufferUsages, WireError> {
        Ok(live(&self.buffers, ObjectType::Buffer, buffer.handle())?.inner.usage)
    }

    pub fn buffer_map_state(&self, buffer: Buffer) -> Result<BufferMapState, WireError> {
        Ok(live(&self.buffers, ObjectType::Buffer, buffer.handle())?
            .inner
            .map_state
            .public())
    }
}
