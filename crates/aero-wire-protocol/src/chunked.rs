//! Incoming side of the wire: reassembling commands from arbitrary chunks.

use crate::error::WireError;
use crate::wire::{CmdHeader, CMD_HEADER_SIZE};

/// Something that consumes raw incoming wire bytes.
pub trait CommandHandler {
    fn handle_commands(&mut self, bytes: &[u8]) -> Result<(), WireError>;
}

/// Buffers partial commands across calls so the dispatcher only ever sees
/// complete ones.
///
/// Commands that arrive whole are dispatched straight from the caller's slice.
/// A command split across calls is copied into an internal buffer sized from
/// its header; that reservation failing is fatal.
#[derive(Debug, Default)]
pub struct ChunkedCommandHandler {
    partial: Vec<u8>,
}

impl ChunkedCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of an incomplete command currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.partial.len()
    }

    pub fn reset(&mut self) {
        self.partial = Vec::new();
    }

    /// Feeds `data` and calls `dispatch(header, body)` for every command it
    /// completes, in order. `body` excludes the header.
    ///
    /// An error from `dispatch` (or a malformed header) stops processing;
    /// remaining bytes are dropped.
    pub fn handle_bytes<F>(&mut self, mut data: &[u8], mut dispatch: F) -> Result<(), WireError>
    where
        F: FnMut(CmdHeader, &[u8]) -> Result<(), WireError>,
    {
        let result = self.handle_bytes_inner(&mut data, &mut dispatch);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn handle_bytes_inner<F>(&mut self, data: &mut &[u8], dispatch: &mut F) -> Result<(), WireError>
    where
        F: FnMut(CmdHeader, &[u8]) -> Result<(), WireError>,
    {
        loop {
            if !self.partial.is_empty() {
                if !self.continue_partial(data, dispatch)? {
                    return Ok(());
                }
                continue;
            }

            if data.is_empty() {
                return Ok(());
            }
            if data.len() < CMD_HEADER_SIZE {
                self.stash(data, CMD_HEADER_SIZE)?;
                *data = &[];
                return Ok(());
            }

            let header = CmdHeader::decode(data)?;
            let size = header.size_bytes as usize;
            if data.len() < size {
                self.stash(data, size)?;
                *data = &[];
                return Ok(());
            }

            let (command, rest) = data.split_at(size);
            *data = rest;
            dispatch(header, &command[CMD_HEADER_SIZE..])?;
        }
    }

    /// Extends the buffered command from `data`. Returns `true` once a
    /// complete command was dispatched and more input may follow.
    fn continue_partial<F>(&mut self, data: &mut &[u8], dispatch: &mut F) -> Result<bool, WireError>
    where
        F: FnMut(CmdHeader, &[u8]) -> Result<(), WireError>,
    {
        if self.partial.len() < CMD_HEADER_SIZE {
            let take = (CMD_HEADER_SIZE - self.partial.len()).min(data.len());
            self.partial.extend_from_slice(&data[..take]);
            *data = &data[take..];
            if self.partial.len() < CMD_HEADER_SIZE {
                return Ok(false);
            }
        }

        let header = CmdHeader::decode(&self.partial)?;
        let size = header.size_bytes as usize;
        reserve_total(&mut self.partial, size)?;

        let take = (size - self.partial.len()).min(data.len());
        self.partial.extend_from_slice(&data[..take]);
        *data = &data[take..];
        if self.partial.len() < size {
            return Ok(false);
        }

        let command = std::mem::take(&mut self.partial);
        dispatch(header, &command[CMD_HEADER_SIZE..])?;
        Ok(true)
    }

    fn stash(&mut self, data: &[u8], expected_total: usize) -> Result<(), WireError> {
        reserve_total(&mut self.partial, expected_total)?;
        self.partial.extend_from_slice(data);
        Ok(())
    }
}

fn reserve_total(buf: &mut Vec<u8>, total: usize) -> Result<(), WireError> {
    let additional = total.saturating_sub(buf.len());
    buf.try_reserve_exact(additional)
        .map_err(|_| WireError::OutOfMemory(total as u64))
}
