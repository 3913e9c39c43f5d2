use aero_wire_protocol::cmd::{
    QueueCreateFence, QueueOnSubmittedWorkDone, QueueSignal, QueueSubmit, QueueWriteBuffer,
};
use aero_wire_protocol::types::encode_handles;
use aero_wire_protocol::{CommandSerializer, ObjectType, RequestStatus, WireError};

use crate::client::{live, Client};
use crate::objects::{Buffer, CommandBuffer, Fence, Queue, WireObject};
use crate::requests::{FenceState, PendingRequest, Proxy};

impl<S: CommandSerializer> Client<S> {
    pub fn queue_submit(
        &mut self,
        queue: Queue,
        command_buffers: &[CommandBuffer],
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        live(&self.queues, ObjectType::Queue, queue.handle())?;
        let handles: Vec<_> = command_buffers
            .iter()
            .map(|cb| {
                live(&self.command_buffers, ObjectType::CommandBuffer, cb.handle())?;
                Ok(cb.handle())
            })
            .collect::<Result<_, WireError>>()?;
        let count = u32::try_from(handles.len()).map_err(|_| {
            WireError::Validation(format!("cannot submit {} command buffers", handles.len()))
        })?;
        self.serialize(
            &QueueSubmit {
                queue: queue.handle(),
                command_buffer_count: count,
            },
            &encode_handles(&handles),
        )
    }

    pub fn queue_write_buffer(
        &mut self,
        queue: Queue,
        buffer: Buffer,
        buffer_offset: u64,
        data: &[u8],
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        live(&self.queues, ObjectType::Queue, queue.handle())?;
        live(&self.buffers, ObjectType::Buffer, buffer.handle())?;
        self.serialize(
            &QueueWriteBuffer {
                queue: queue.handle(),
                buffer: buffer.handle(),
                buffer_offset,
                data_len: data.len() as u64,
            },
            data,
        )
    }

    /// Resolves once all work submitted so far has finished on the server.
    pub fn queue_on_submitted_work_done(
        &mut self,
        queue: Queue,
        callback: impl FnOnce(RequestStatus) + 'static,
    ) -> Result<(), WireError> {
        if self.is_disconnected() {
            callback(RequestStatus::Disconnected);
            return Ok(());
        }
        let Some(proxy) = self.queues.get_mut(queue.handle()) else {
            callback(RequestStatus::Error);
            return Ok(());
        };
        let request_serial = proxy
            .requests
            .issue(PendingRequest::WorkDone(Box::new(callback)));
        self.serialize(
            &QueueOnSubmittedWorkDone {
                queue: queue.handle(),
                request_serial,
            },
            &[],
        )
    }

    pub fn queue_create_fence(
        &mut self,
        queue: Queue,
        initial_value: u64,
    ) -> Result<Fence, WireError> {
        self.ensure_connected()?;
        let device = live(&self.queues, ObjectType::Queue, queue.handle())?.device;
        let result = self.fences.allocate(Proxy::new(
            device,
            FenceState {
                completed_value: initial_value,
            },
        ));
        self.serialize(
            &QueueCreateFence {
                queue: queue.handle(),
                result,
                initial_value,
            },
            &[],
        )?;
        Ok(Fence::from_handle(result))
    }

    /// Signals `fence` with `value` once previously submitted work completes.
    pub fn queue_signal(&mut self, queue: Queue, fence: Fence, value: u64) -> Result<(), WireError> {
        self.ensure_connected()?;
        live(&self.queues, ObjectType::Queue, queue.handle())?;
        live(&self.fences, ObjectType::Fence, fence.handle())?;
        self.serialize(
            &QueueSignal {
                queue: queue.handle(),
                fence: fence.handle(),
                value,
            },
            &[],
        )
    }
}
