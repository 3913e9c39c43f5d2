//! Little-endian field codecs and the command header.
//!
//! Every command starts with a 16-byte [`CmdHeader`]:
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 8    | `size_bytes` |
//! | 8      | 4    | `command_id` |
//! | 12     | 4    | reserved (0) |
//!
//! `size_bytes` covers the header, the fixed fields, the trailing blob and the
//! zero padding that rounds the command up to [`CMD_ALIGN`].

use crate::error::DecodeError;
use crate::handle::ObjectHandle;

pub const CMD_HEADER_SIZE: usize = 16;

/// Every command occupies a multiple of this many bytes.
pub const CMD_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub size_bytes: u64,
    pub command_id: u32,
}

impl CmdHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.size_bytes.to_le_bytes());
        out[8..12].copy_from_slice(&self.command_id.to_le_bytes());
        out[12..16].fill(0);
    }

    /// Decodes and sanity-checks a header. `bytes` must hold at least
    /// [`CMD_HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let size_bytes = r.read_u64()?;
        let command_id = r.read_u32()?;
        let _reserved0 = r.read_u32()?;

        if size_bytes < CMD_HEADER_SIZE as u64
            || size_bytes % CMD_ALIGN as u64 != 0
            || usize::try_from(size_bytes).is_err()
        {
            return Err(DecodeError::BadSizeBytes {
                command_id,
                size_bytes,
            });
        }

        Ok(Self {
            size_bytes,
            command_id,
        })
    }
}

pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

pub fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Bounds-checked little-endian cursor over a byte slice.
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    pub fn read_str(&mut self, len: usize) -> Result<&'a str, DecodeError> {
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// Writes fixed fields into a pre-sized slice. Out-of-range writes panic; the
/// slice is always sized from [`WireCommand::FIXED_SIZE`](crate::cmd::WireCommand::FIXED_SIZE).
pub struct Writer<'a> {
    bytes: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.bytes[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

/// A fixed-width field of a command record.
pub trait WireField: Sized {
    const SIZE: usize;

    fn write(&self, w: &mut Writer<'_>);
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

impl WireField for u32 {
    const SIZE: usize = 4;

    fn write(&self, w: &mut Writer<'_>) {
        w.put_u32(*self);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_u32()
    }
}

impl WireField for u64 {
    const SIZE: usize = 8;

    fn write(&self, w: &mut Writer<'_>) {
        w.put_u64(*self);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_u64()
    }
}

impl WireField for bool {
    const SIZE: usize = 4;

    fn write(&self, w: &mut Writer<'_>) {
        w.put_u32(u32::from(*self));
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match r.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidEnum {
                field: "bool",
                value,
            }),
        }
    }
}

impl WireField for ObjectHandle {
    const SIZE: usize = 8;

    fn write(&self, w: &mut Writer<'_>) {
        w.put_u32(self.id);
        w.put_u32(self.generation);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(ObjectHandle {
            id: r.read_u32()?,
            generation: r.read_u32()?,
        })
    }
}
