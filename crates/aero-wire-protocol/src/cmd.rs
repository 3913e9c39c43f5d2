//! Command records for both directions of the wire.
//!
//! Each record is a header, a run of fixed-width little-endian fields, and an
//! optional trailing blob whose length is carried by one of the fixed fields.
//! The whole command is zero-padded to [`CMD_ALIGN`].
//!
//! Ranges: `0x0001` generic, `0x01xx` device, `0x02xx` queue, `0x03xx` fence,
//! `0x04xx` buffer, `0x05xx` shader module, `0x06xx` command encoder,
//! `0x80xx` server-to-client returns.

use crate::error::DecodeError;
use crate::handle::ObjectHandle;
use crate::wire::{align_up, Reader, WireField, Writer, CMD_ALIGN, CMD_HEADER_SIZE};

/// A fixed-layout command record.
pub trait WireCommand: Sized {
    const ID: u32;
    const NAME: &'static str;
    /// Bytes of fixed fields following the header.
    const FIXED_SIZE: usize;

    fn write_fixed(&self, w: &mut Writer<'_>);
    fn read_fixed(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Length of the trailing blob this record declares.
    fn trailing_len(&self) -> u64;

    /// Total encoded size including header and padding.
    fn encoded_size(&self) -> u64 {
        let unpadded =
            ((CMD_HEADER_SIZE + Self::FIXED_SIZE) as u64).saturating_add(self.trailing_len());
        let align = CMD_ALIGN as u64;
        unpadded.saturating_add(align - 1) & !(align - 1)
    }
}

/// Splits a command body (everything after the header) into its record and
/// trailing blob, checking that the declared size is exactly right.
pub fn decode_body<C: WireCommand>(body: &[u8]) -> Result<(C, &[u8]), DecodeError> {
    let bad_size = || DecodeError::BadSizeBytes {
        command_id: C::ID,
        size_bytes: (CMD_HEADER_SIZE + body.len()) as u64,
    };

    if body.len() < C::FIXED_SIZE {
        return Err(bad_size());
    }
    let mut r = Reader::new(body);
    let cmd = C::read_fixed(&mut r)?;
    debug_assert_eq!(r.position(), C::FIXED_SIZE);

    if cmd.encoded_size() != (CMD_HEADER_SIZE + body.len()) as u64 {
        return Err(bad_size());
    }
    // encoded_size matched, so the trailing blob fits inside the body.
    let trailing_len = cmd.trailing_len() as usize;
    let trailing = &body[C::FIXED_SIZE..C::FIXED_SIZE + trailing_len];
    Ok((cmd, trailing))
}

macro_rules! wire_commands {
    (
        $(#[$enum_meta:meta])*
        pub enum $enum_name:ident {
            $(
                $(#[$meta:meta])*
                $name:ident = $id:literal {
                    $( $field:ident : $ty:ty ),* $(,)?
                } $( trailing $len:ident $( * $mul:literal )? )?;
            )*
        }
    ) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub struct $name {
                $( pub $field: $ty, )*
            }

            impl WireCommand for $name {
                const ID: u32 = $id;
                const NAME: &'static str = stringify!($name);
                const FIXED_SIZE: usize = 0 $( + <$ty as WireField>::SIZE )*;

                #[allow(unused_variables)]
                fn write_fixed(&self, w: &mut Writer<'_>) {
                    $( WireField::write(&self.$field, w); )*
                }

                #[allow(unused_variables)]
                fn read_fixed(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    Ok(Self {
                        $( $field: <$ty as WireField>::read(r)?, )*
                    })
                }

                fn trailing_len(&self) -> u64 {
                    0u64 $( + (self.$len as u64) $( .saturating_mul($mul) )? )?
                }
            }
        )*

        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $enum_name<'a> {
            $( $name($name, &'a [u8]), )*
        }

        impl<'a> $enum_name<'a> {
            /// Decodes the body of a command whose header carried `command_id`.
            pub fn decode(command_id: u32, body: &'a [u8]) -> Result<Self, DecodeError> {
                match command_id {
                    $( $id => {
                        let (cmd, trailing) = decode_body::<$name>(body)?;
                        Ok(Self::$name(cmd, trailing))
                    } )*
                    other => Err(DecodeError::UnknownCommand(other)),
                }
            }

            pub fn command_id(&self) -> u32 {
                match self {
                    $( Self::$name(..) => $id, )*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$name(..) => stringify!($name), )*
                }
            }
        }
    };
}

wire_commands! {
    /// Client-to-server commands.
    pub enum WireCmd {
        /// Releases the server-side object behind `handle`.
        DestroyObject = 0x0001 {
            object_type: u32,
            handle: ObjectHandle,
        };

        DeviceCreateBuffer = 0x0100 {
            device: ObjectHandle,
            result: ObjectHandle,
            size: u64,
            usage: u32,
            mapped_at_creation: bool,
        };
        /// Trailing blob: WGSL source, UTF-8.
        DeviceCreateShaderModule = 0x0101 {
            device: ObjectHandle,
            result: ObjectHandle,
            code_len: u64,
        } trailing code_len;
        DeviceCreateCommandEncoder = 0x0102 {
            device: ObjectHandle,
            result: ObjectHandle,
        };
        DeviceGetQueue = 0x0103 {
            device: ObjectHandle,
            result: ObjectHandle,
        };
        DevicePushErrorScope = 0x0104 {
            device: ObjectHandle,
            filter: u32,
        };
        DevicePopErrorScope = 0x0105 {
            device: ObjectHandle,
            request_serial: u64,
        };
        /// Loses the device on purpose. The handle stays valid until released.
        DeviceDestroy = 0x0106 {
            device: ObjectHandle,
        };

        /// Trailing blob: `command_buffer_count` handles.
        QueueSubmit = 0x0200 {
            queue: ObjectHandle,
            command_buffer_count: u32,
        } trailing command_buffer_count * 8;
        QueueWriteBuffer = 0x0201 {
            queue: ObjectHandle,
            buffer: ObjectHandle,
            buffer_offset: u64,
            data_len: u64,
        } trailing data_len;
        QueueOnSubmittedWorkDone = 0x0202 {
            queue: ObjectHandle,
            request_serial: u64,
        };
        QueueCreateFence = 0x0203 {
            queue: ObjectHandle,
            result: ObjectHandle,
            initial_value: u64,
        };
        QueueSignal = 0x0204 {
            queue: ObjectHandle,
            fence: ObjectHandle,
            value: u64,
        };

        FenceOnCompletion = 0x0300 {
            fence: ObjectHandle,
            value: u64,
            request_serial: u64,
        };

        BufferMapAsync = 0x0400 {
            buffer: ObjectHandle,
            request_serial: u64,
            mode: u32,
            offset: u64,
            size: u64,
        };
        /// Write-back of client-side mapped memory, sent before `BufferUnmap`.
        BufferUpdateMappedData = 0x0401 {
            buffer: ObjectHandle,
            offset: u64,
            data_len: u64,
        } trailing data_len;
        BufferUnmap = 0x0402 {
            buffer: ObjectHandle,
        };
        /// Frees the buffer's storage; later use is a validation error.
        BufferDestroy = 0x0403 {
            buffer: ObjectHandle,
        };

        ShaderModuleGetCompilationInfo = 0x0500 {
            shader_module: ObjectHandle,
            request_serial: u64,
        };

        CommandEncoderCopyBufferToBuffer = 0x0600 {
            encoder: ObjectHandle,
            source: ObjectHandle,
            source_offset: u64,
            destination: ObjectHandle,
            destination_offset: u64,
            size: u64,
        };
        CommandEncoderFinish = 0x0601 {
            encoder: ObjectHandle,
            result: ObjectHandle,
        };
    }
}

wire_commands! {
    /// Server-to-client commands.
    pub enum ReturnWireCmd {
        /// Trailing blob: the mapped range on success.
        BufferMapAsyncCallback = 0x8001 {
            buffer: ObjectHandle,
            request_serial: u64,
            status: u32,
            data_len: u64,
        } trailing data_len;
        /// Trailing blob: encoded compilation messages.
        ShaderModuleGetCompilationInfoCallback = 0x8002 {
            shader_module: ObjectHandle,
            request_serial: u64,
            status: u32,
            info_len: u64,
        } trailing info_len;
        QueueWorkDoneCallback = 0x8003 {
            queue: ObjectHandle,
            request_serial: u64,
            status: u32,
        };
        FenceOnCompletionCallback = 0x8004 {
            fence: ObjectHandle,
            request_serial: u64,
            status: u32,
            completed_value: u64,
        };
        DevicePopErrorScopeCallback = 0x8005 {
            device: ObjectHandle,
            request_serial: u64,
            status: u32,
            error_type: u32,
            message_len: u64,
        } trailing message_len;
        DeviceUncapturedErrorCallback = 0x8006 {
            device: ObjectHandle,
            error_type: u32,
            message_len: u64,
        } trailing message_len;
        DeviceLostCallback = 0x8007 {
            device: ObjectHandle,
            reason: u32,
            message_len: u64,
        } trailing message_len;
    }
}

/// Encodes a command into a fresh buffer. Used where the transport is a plain
/// byte vector, e.g. tests and fuzzing harnesses.
pub fn encode_to_vec<C: WireCommand>(cmd: &C, trailing: &[u8]) -> Vec<u8> {
    let size = cmd.encoded_size() as usize;
    let mut out = vec![0u8; size];
    crate::wire::CmdHeader {
        size_bytes: size as u64,
        command_id: C::ID,
    }
    .encode(&mut out[..CMD_HEADER_SIZE]);
    let fixed_end = CMD_HEADER_SIZE + C::FIXED_SIZE;
    cmd.write_fixed(&mut Writer::new(&mut out[CMD_HEADER_SIZE..fixed_end]));
    out[fixed_end..fixed_end + trailing.len()].copy_from_slice(trailing);
    debug_assert_eq!(align_up(fixed_end + trailing.len(), CMD_ALIGN), size);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::CmdHeader;

    #[test]
    fn fixed_sizes_follow_field_widths() {
        assert_eq!(DestroyObject::FIXED_SIZE, 12);
        assert_eq!(DeviceCreateBuffer::FIXED_SIZE, 8 + 8 + 8 + 4 + 4);
        assert_eq!(QueueSubmit::FIXED_SIZE, 12);
        assert_eq!(BufferMapAsyncCallback::FIXED_SIZE, 8 + 8 + 4 + 8);
    }

    #[test]
    fn encoded_size_includes_padding() {
        let cmd = DeviceCreateShaderModule {
            device: ObjectHandle::new(1, 1),
            result: ObjectHandle::new(1, 1),
            code_len: 3,
        };
        // 16 header + 24 fixed + 3 trailing = 43, padded to 48.
        assert_eq!(cmd.encoded_size(), 48);

        let submit = QueueSubmit {
            queue: ObjectHandle::new(2, 1),
            command_buffer_count: 2,
        };
        assert_eq!(submit.trailing_len(), 16);
    }

    #[test]
    fn decode_splits_trailing_from_padding() {
        let cmd = QueueWriteBuffer {
            queue: ObjectHandle::new(2, 1),
            buffer: ObjectHandle::new(5, 3),
            buffer_offset: 64,
            data_len: 5,
        };
        let bytes = encode_to_vec(&cmd, b"hello");
        let header = CmdHeader::decode(&bytes).unwrap();
        assert_eq!(header.size_bytes as usize, bytes.len());

        let decoded = WireCmd::decode(header.command_id, &bytes[CMD_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, WireCmd::QueueWriteBuffer(cmd, b"hello"));
        assert_eq!(decoded.name(), "QueueWriteBuffer");
    }

    #[test]
    fn decode_rejects_lying_length_fields() {
        let cmd = QueueWriteBuffer {
            queue: ObjectHandle::new(2, 1),
            buffer: ObjectHandle::new(5, 3),
            buffer_offset: 0,
            data_len: 5,
        };
        let mut bytes = encode_to_vec(&cmd, b"hello");
        // Claim far more trailing data than the command carries.
        let data_len_at = CMD_HEADER_SIZE + 8 + 8 + 8;
        bytes[data_len_at..data_len_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());

        let err = WireCmd::decode(QueueWriteBuffer::ID, &bytes[CMD_HEADER_SIZE..]).unwrap_err();
        assert!(matches!(err, DecodeError::BadSizeBytes { .. }), "{err:?}");
    }

    #[test]
    fn decode_rejects_unknown_ids_and_short_bodies() {
        assert_eq!(
            WireCmd::decode(0x7777, &[]),
            Err(DecodeError::UnknownCommand(0x7777))
        );
        assert!(matches!(
            ReturnWireCmd::decode(QueueWorkDoneCallback::ID, &[0u8; 4]),
            Err(DecodeError::BadSizeBytes { .. })
        ));
    }
}
