use aero_wire_protocol::cmd::{CommandEncoderCopyBufferToBuffer, CommandEncoderFinish};
use aero_wire_protocol::{CommandSerializer, ObjectType, WireError};

use crate::client::{live, Client};
use crate::objects::{Buffer, CommandBuffer, CommandEncoder, WireObject};
use crate::requests::Proxy;

impl<S: CommandSerializer> Client<S> {
    pub fn command_encoder_copy_buffer_to_buffer(
        &mut self,
        encoder: CommandEncoder,
        source: Buffer,
        source_offset: u64,
        destination: Buffer,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), WireError> {
        self.ensure_connected()?;
        live(&self.command_encoders, ObjectType::CommandEncoder, encoder.handle())?;
        live(&self.buffers, ObjectType::Buffer, source.handle())?;
        live(&self.buffers, ObjectType::Buffer, destination.handle())?;
        self.serialize(
            &CommandEncoderCopyBufferToBuffer {
                encoder: encoder.handle(),
                source: source.handle(),
                source_offset,
                destination: destination.handle(),
                destination_offset,
                size,
            },
            &[],
        )
    }

    /// Finishes recording. The encoder stays allocated until released but
    /// the server rejects further use of it.
    pub fn command_encoder_finish(
        &mut self,
        encoder: CommandEncoder,
    ) -> Result<CommandBuffer, WireError> {
        self.ensure_connected()?;
        let device = live(&self.command_encoders, ObjectType::CommandEncoder, encoder.handle())?
            .device;
        let result = self.command_buffers.allocate(Proxy::new(device, ()));
        self.serialize(
            &CommandEncoderFinish {
                encoder: encoder.handle(),
                result,
            },
            &[],
        )?;
        Ok(CommandBuffer::from_handle(result))
    }
}
