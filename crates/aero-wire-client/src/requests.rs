//! Pending async requests and their single resolution path.

use std::collections::BTreeMap;

use aero_wire_protocol::{
    CompilationMessage, DeviceLostReason, ErrorType, MapMode, ObjectHandle, RequestStatus,
};

pub type MapAsyncCallback = Box<dyn FnOnce(RequestStatus)>;
pub type CompilationInfoCallback = Box<dyn FnOnce(RequestStatus, &[CompilationMessage])>;
pub type WorkDoneCallback = Box<dyn FnOnce(RequestStatus)>;
pub type FenceCompletionCallback = Box<dyn FnOnce(RequestStatus)>;
pub type PopErrorScopeCallback = Box<dyn FnOnce(RequestStatus, ErrorType, &str)>;
pub type DeviceLostCallback = Box<dyn FnOnce(DeviceLostReason, &str)>;
pub type UncapturedErrorCallback = Box<dyn FnMut(ErrorType, &str)>;

pub(crate) enum PendingRequest {
    MapAsync(MapAsyncCallback),
    CompilationInfo(CompilationInfoCallback),
    WorkDone(WorkDoneCallback),
    FenceCompletion(FenceCompletionCallback),
    PopErrorScope(PopErrorScopeCallback),
}

impl PendingRequest {
    /// Invokes the callback with `status` and no payload.
    pub(crate) fn resolve(self, status: RequestStatus) {
        match self {
            PendingRequest::MapAsync(cb) => cb(status),
            PendingRequest::CompilationInfo(cb) => cb(status, &[]),
            PendingRequest::WorkDone(cb) => cb(status),
            PendingRequest::FenceCompletion(cb) => cb(status),
            PendingRequest::PopErrorScope(cb) => cb(status, ErrorType::Unknown, ""),
        }
    }
}

/// Resolves a batch of requests in serial order. Callers gather the batch
/// first so every table mutation is done before user code runs.
pub(crate) fn resolve_all(requests: Vec<PendingRequest>, status: RequestStatus) {
    for request in requests {
        request.resolve(status);
    }
}

/// Requests in flight against one object, keyed by a per-object serial.
#[derive(Default)]
pub(crate) struct PendingRequests {
    last_serial: u64,
    requests: BTreeMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn issue(&mut self, request: PendingRequest) -> u64 {
        self.last_serial += 1;
        self.requests.insert(self.last_serial, request);
        self.last_serial
    }

    pub(crate) fn take(&mut self, serial: u64) -> Option<PendingRequest> {
        self.requests.remove(&serial)
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Client-side record of one live object.
pub(crate) struct Proxy<T> {
    pub(crate) refcount: u32,
    /// Owning device; null for devices themselves.
    pub(crate) device: ObjectHandle,
    pub(crate) requests: PendingRequests,
    pub(crate) inner: T,
}

impl<T> Proxy<T> {
    pub(crate) fn new(device: ObjectHandle, inner: T) -> Self {
        Self {
            refcount: 1,
            device,
            requests: PendingRequests::default(),
            inner,
        }
    }
}

#[derive(Default)]
pub(crate) struct DeviceState {
    pub(crate) lost_callback: Option<DeviceLostCallback>,
    pub(crate) uncaptured_error_callback: Option<UncapturedErrorCallback>,
}

pub(crate) struct BufferState {
    pub(crate) size: u64,
    pub(crate) usage: aero_wire_protocol::BufferUsages,
    pub(crate) map_state: MapState,
    pub(crate) destroyed: bool,
}

impl BufferState {
    pub(crate) fn new(size: u64, usage: aero_wire_protocol::BufferUsages, map_state: MapState) -> Self {
        Self {
            size,
            usage,
            map_state,
            destroyed: false,
        }
    }

    /// Marks the buffer destroyed and drops any mapping. Returns the serial
    /// of a map request that was still pending.
    pub(crate) fn destroy(&mut self) -> Option<u64> {
        self.destroyed = true;
        match std::mem::replace(&mut self.map_state, MapState::Unmapped) {
            MapState::Pending { serial, .. } => Some(serial),
            _ => None,
        }
    }
}

pub(crate) enum MapState {
    Unmapped,
    Pending {
        serial: u64,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    Mapped {
        mode: MapMode,
        offset: u64,
        data: Vec<u8>,
    },
}

/// Observable mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMapState {
    Unmapped,
    Pending,
    Mapped,
}

impl MapState {
    pub(crate) fn public(&self) -> BufferMapState {
        match self {
            MapState::Unmapped => BufferMapState::Unmapped,
            MapState::Pending { .. } => BufferMapState::Pending,
            MapState::Mapped { .. } => BufferMapState::Mapped,
        }
    }
}

#[derive(Default)]
pub(crate) struct FenceState {
    pub(crate) completed_value: u64,
}
