//! Wire transport over a [`CommandRing`].
//!
//! The sending side stages command bytes locally and publishes them as one
//! ring record per flush (or whenever the staging buffer fills). Records are
//! plain byte chunks; a command may span several of them and the receiving
//! [`ChunkedCommandHandler`](aero_wire_protocol::ChunkedCommandHandler)
//! stitches it back together.

use std::sync::Arc;

use aero_wire_protocol::{CommandHandler, CommandSerializer, WireError};
use tracing::{debug, trace};

use crate::ring::{max_payload_len_for_capacity, CommandRing, PopError, PushError};

pub struct RingCommandSerializer {
    ring: Arc<CommandRing>,
    staging: Vec<u8>,
    max_allocation_size: usize,
}

impl RingCommandSerializer {
    /// `max_allocation_size` is clamped to the largest record the ring can
    /// hold at all.
    pub fn new(ring: Arc<CommandRing>, max_allocation_size: usize) -> Self {
        let max_allocation_size =
            max_allocation_size.min(max_payload_len_for_capacity(ring.capacity_bytes()));
        Self {
            ring,
            staging: Vec::with_capacity(max_allocation_size),
            max_allocation_size,
        }
    }

    pub fn ring(&self) -> &Arc<CommandRing> {
        &self.ring
    }

    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    fn publish_staging(&mut self) -> bool {
        if self.staging.is_empty() {
            return true;
        }
        match self.ring.try_push(&self.staging) {
            Ok(()) => {
                trace!(bytes = self.staging.len(), "published ring record");
                self.staging.clear();
                true
            }
            Err(err @ (PushError::Full | PushError::TooLarge)) => {
                debug!(%err, bytes = self.staging.len(), "ring rejected staged commands");
                false
            }
        }
    }
}

impl CommandSerializer for RingCommandSerializer {
    fn max_allocation_size(&self) -> usize {
        self.max_allocation_size
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.max_allocation_size {
            return None;
        }
        if self.staging.len() + size > self.max_allocation_size && !self.publish_staging() {
            return None;
        }
        let start = self.staging.len();
        self.staging.resize(start + size, 0);
        Some(&mut self.staging[start..])
    }

    fn flush(&mut self) -> bool {
        self.publish_staging()
    }

    fn discard_partial_command(&mut self, written: usize) {
        // Chunks already published stay in the ring; the receiver never
        // completes them.
        let keep = self.staging.len().saturating_sub(written);
        self.staging.truncate(keep);
    }
}

pub struct RingCommandReceiver {
    ring: Arc<CommandRing>,
    scratch: Vec<u8>,
}

impl RingCommandReceiver {
    pub fn new(ring: Arc<CommandRing>) -> Self {
        Self {
            ring,
            scratch: Vec::new(),
        }
    }

    /// Drains every published record into `handler`. Returns the number of
    /// records delivered.
    pub fn pump<H: CommandHandler + ?Sized>(&mut self, handler: &mut H) -> Result<usize, WireError> {
        let mut records = 0;
        loop {
            match self.ring.try_pop_into(&mut self.scratch) {
                Ok(()) => {
                    records += 1;
                    handler.handle_commands(&self.scratch)?;
                }
                Err(PopError::Empty) => return Ok(records),
                Err(PopError::Corrupt) => {
                    return Err(WireError::TransportCorrupt("bad ring record length"))
                }
            }
        }
    }
}

/// Creates a connected serializer/receiver pair over a fresh ring.
pub fn ring_channel(
    ring: CommandRing,
    max_allocation_size: usize,
) -> (RingCommandSerializer, RingCommandReceiver) {
    let ring = Arc::new(ring);
    (
        RingCommandSerializer::new(ring.clone(), max_allocation_size),
        RingCommandReceiver::new(ring),
    )
}
