//! Outgoing side of the wire: writing command records into transport space.

use tracing::trace;

use crate::cmd::WireCommand;
use crate::error::WireError;
use crate::wire::{align_up, CmdHeader, Writer, CMD_ALIGN, CMD_HEADER_SIZE};

/// Transport that hands out space for outgoing command bytes.
pub trait CommandSerializer {
    /// Largest `size` [`get_cmd_space`](Self::get_cmd_space) will honor.
    fn max_allocation_size(&self) -> usize;

    /// Returns exactly `size` writable bytes, or `None` when the transport
    /// cannot provide them.
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]>;

    /// Makes every byte handed out so far visible to the peer.
    fn flush(&mut self) -> bool;

    /// Called when a command is abandoned after `written` of its bytes were
    /// already handed out. Transports that have not published those bytes yet
    /// should drop them.
    fn discard_partial_command(&mut self, _written: usize) {}
}

impl<S: CommandSerializer + ?Sized> CommandSerializer for &mut S {
    fn max_allocation_size(&self) -> usize {
        (**self).max_allocation_size()
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        (**self).get_cmd_space(size)
    }

    fn flush(&mut self) -> bool {
        (**self).flush()
    }

    fn discard_partial_command(&mut self, written: usize) {
        (**self).discard_partial_command(written)
    }
}

/// Serializes commands of any size, splitting those larger than the
/// transport's allocation limit into consecutive chunks.
#[derive(Debug)]
pub struct ChunkedCommandSerializer<S> {
    inner: S,
}

const ZERO_PADDING: [u8; CMD_ALIGN] = [0; CMD_ALIGN];

impl<S: CommandSerializer> ChunkedCommandSerializer<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn serialize<C: WireCommand>(&mut self, cmd: &C, trailing: &[u8]) -> Result<(), WireError> {
        if cmd.trailing_len() != trailing.len() as u64 {
            return Err(WireError::TrailingLength {
                declared: cmd.trailing_len(),
                actual: trailing.len(),
            });
        }

        let prefix_len = CMD_HEADER_SIZE + C::FIXED_SIZE;
        let unpadded = prefix_len + trailing.len();
        let total = align_up(unpadded, CMD_ALIGN);
        let header = CmdHeader {
            size_bytes: total as u64,
            command_id: C::ID,
        };
        trace!(command = C::NAME, size = total, "serialize");

        let max = self.inner.max_allocation_size();
        if total <= max {
            let Some(space) = self.inner.get_cmd_space(total) else {
                self.inner.discard_partial_command(0);
                return Err(WireError::TransportAllocation { size: total });
            };
            header.encode(&mut space[..CMD_HEADER_SIZE]);
            cmd.write_fixed(&mut Writer::new(&mut space[CMD_HEADER_SIZE..prefix_len]));
            space[prefix_len..unpadded].copy_from_slice(trailing);
            space[unpadded..total].fill(0);
            return Ok(());
        }

        if max == 0 {
            return Err(WireError::TransportAllocation { size: total });
        }

        let mut prefix = vec![0u8; prefix_len];
        header.encode(&mut prefix[..CMD_HEADER_SIZE]);
        cmd.write_fixed(&mut Writer::new(&mut prefix[CMD_HEADER_SIZE..]));
        let parts = [
            prefix.as_slice(),
            trailing,
            &ZERO_PADDING[..total - unpadded],
        ];
        self.write_chunked(&parts, total, max)
    }

    /// Streams `parts` (which concatenate to `total` bytes) through chunks of
    /// at most `max` bytes.
    fn write_chunked(&mut self, parts: &[&[u8]], total: usize, max: usize) -> Result<(), WireError> {
        let mut part = 0;
        let mut part_offset = 0;
        let mut written = 0;

        while written < total {
            let chunk_len = (total - written).min(max);
            let Some(space) = self.inner.get_cmd_space(chunk_len) else {
                self.inner.discard_partial_command(written);
                return Err(WireError::TransportAllocation { size: chunk_len });
            };

            let mut filled = 0;
            while filled < chunk_len {
                let src = &parts[part][part_offset..];
                let n = src.len().min(chunk_len - filled);
                space[filled..filled + n].copy_from_slice(&src[..n]);
                filled += n;
                part_offset += n;
                if part_offset == parts[part].len() {
                    part += 1;
                    part_offset = 0;
                }
            }
            written += chunk_len;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), WireError> {
        if self.inner.flush() {
            Ok(())
        } else {
            Err(WireError::TransportFlush)
        }
    }
}

/// Growable in-memory transport.
///
/// Bytes handed out by `get_cmd_space` become visible through
/// [`take_flushed`](Self::take_flushed) once [`flush`](CommandSerializer::flush)
/// is called.
#[derive(Debug)]
pub struct MemoryTransport {
    max_allocation_size: usize,
    pending: Vec<u8>,
    flushed: Vec<u8>,
    allocations: usize,
}

impl MemoryTransport {
    pub fn new(max_allocation_size: usize) -> Self {
        Self {
            max_allocation_size,
            pending: Vec::new(),
            flushed: Vec::new(),
            allocations: 0,
        }
    }

    pub fn take_flushed(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.flushed)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of successful `get_cmd_space` calls so far.
    pub fn allocations(&self) -> usize {
        self.allocations
    }
}

impl CommandSerializer for MemoryTransport {
    fn max_allocation_size(&self) -> usize {
        self.max_allocation_size
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.max_allocation_size {
            return None;
        }
        let start = self.pending.len();
        self.pending.try_reserve(size).ok()?;
        self.pending.resize(start + size, 0);
        self.allocations += 1;
        Some(&mut self.pending[start..])
    }

    fn flush(&mut self) -> bool {
        self.flushed.append(&mut self.pending);
        true
    }

    fn discard_partial_command(&mut self, written: usize) {
        let keep = self.pending.len().saturating_sub(written);
        self.pending.truncate(keep);
    }
}
