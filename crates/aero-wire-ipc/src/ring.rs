//! Lock-free bounded ring of variable-length records.
//!
//! Each record is a little-endian `u32` length followed by the payload,
//! padded to [`RECORD_ALIGN`]. A record never straddles the end of the
//! buffer: when it does not fit, the producer writes [`WRAP_MARKER`] (or
//! leaves fewer than 4 bytes of implicit padding) and starts over at offset 0.
//!
//! Producers reserve space by advancing `tail_reserve` with a CAS and publish
//! in reservation order through `tail_commit`, so any number of threads may
//! push while one thread pops.

use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// Records start on this byte alignment.
pub const RECORD_ALIGN: usize = 4;

/// Length value that tells the consumer to skip to the start of the buffer.
pub const WRAP_MARKER: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("ring is full")]
    Full,
    #[error("record does not fit in the ring")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PopError {
    #[error("ring is empty")]
    Empty,
    #[error("ring corrupted")]
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring capacity {0} must be a power of two between 4 bytes and 2 GiB")]
    BadCapacity(usize),
}

pub struct CommandRing {
    cap: u32,
    head: AtomicU32,
    tail_reserve: AtomicU32,
    tail_commit: AtomicU32,

    data_ptr: *mut u8,
    _storage: Box<[u8]>,
}

// SAFETY: all access to `data_ptr` is confined to regions handed out by the
// head/tail protocol; a byte range is owned by exactly one producer between
// reservation and commit, and by the consumer between commit and head advance.
unsafe impl Send for CommandRing {}
unsafe impl Sync for CommandRing {}

impl CommandRing {
    pub fn new(capacity_bytes: usize) -> Result<Self, RingError> {
        // Positions are free-running u32 counters, so the capacity must
        // divide 2^32 for `pos % cap` to stay continuous across wraparound.
        if capacity_bytes < RECORD_ALIGN
            || !capacity_bytes.is_power_of_two()
            || capacity_bytes > 1 << 31
        {
            return Err(RingError::BadCapacity(capacity_bytes));
        }
        let mut storage = vec![0u8; capacity_bytes].into_boxed_slice();
        let data_ptr = storage.as_mut_ptr();
        Ok(Self {
            cap: capacity_bytes as u32,
            head: AtomicU32::new(0),
            tail_reserve: AtomicU32::new(0),
            tail_commit: AtomicU32::new(0),
            data_ptr,
            _storage: storage,
        })
    }

    pub fn capacity_bytes(&self) -> usize {
        self.cap as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail_commit.load(Ordering::Acquire)
    }

    pub fn try_push(&self, payload: &[u8]) -> Result<(), PushError> {
        let payload_len = payload.len();
        if payload_len > (u32::MAX as usize).saturating_sub(4) {
            return Err(PushError::TooLarge);
        }
        let record_size = record_size(payload_len);
        if record_size > self.cap as usize {
            return Err(PushError::TooLarge);
        }

        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_reserve.load(Ordering::Acquire);

            let used = tail.wrapping_sub(head);
            if used > self.cap {
                // `head` moved between the two loads.
                continue;
            }
            let free = self.cap - used;

            let tail_index = (tail % self.cap) as usize;
            let remaining = (self.cap as usize) - tail_index;
            let (padding, write_wrap_marker) = if remaining < 4 {
                (remaining, false)
            } else if remaining < record_size {
                (remaining, true)
            } else {
                (0, false)
            };

            let reserve = padding + record_size;
            if reserve as u32 > free {
                return Err(PushError::Full);
            }

            let new_tail = tail.wrapping_add(reserve as u32);
            if self
                .tail_reserve
                .compare_exchange(tail, new_tail, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let start_index = (tail.wrapping_add(padding as u32) % self.cap) as usize;
            // SAFETY: [tail, new_tail) is reserved for this producer and the
            // record fits contiguously from `start_index`.
            unsafe {
                if write_wrap_marker {
                    write_u32_le(self.data_ptr.add(tail_index), WRAP_MARKER);
                }
                write_u32_le(self.data_ptr.add(start_index), payload_len as u32);
                core::ptr::copy_nonoverlapping(
                    payload.as_ptr(),
                    self.data_ptr.add(start_index + 4),
                    payload_len,
                );
            }

            // Publish in reservation order.
            while self.tail_commit.load(Ordering::Acquire) != tail {
                core::hint::spin_loop();
            }
            self.tail_commit.store(new_tail, Ordering::Release);
            return Ok(());
        }
    }

    /// Pushes, spinning while the ring is full.
    pub fn push_spinning(&self, payload: &[u8]) -> Result<(), PushError> {
        loop {
            match self.try_push(payload) {
                Err(PushError::Full) => std::thread::yield_now(),
                other => return other,
            }
        }
    }

    /// Pops the next record into `out`, replacing its contents.
    /// Single consumer only.
    pub fn try_pop_into(&self, out: &mut Vec<u8>) -> Result<(), PopError> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail_commit.load(Ordering::Acquire);
            if head == tail {
                return Err(PopError::Empty);
            }

            let head_index = (head % self.cap) as usize;
            let remaining = (self.cap as usize) - head_index;
            if remaining < 4 {
                self.head
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }

            // SAFETY: head != tail_commit, so at least a length word is published here.
            let len = unsafe { read_u32_le(self.data_ptr.add(head_index)) };
            if len == WRAP_MARKER {
                self.head
                    .store(head.wrapping_add(remaining as u32), Ordering::Release);
                continue;
            }

            let len = len as usize;
            let total = record_size(len);
            if total > remaining || tail.wrapping_sub(head) < total as u32 {
                return Err(PopError::Corrupt);
            }

            out.clear();
            out.reserve(len);
            // SAFETY: the whole record lies inside the committed region.
            unsafe {
                let src = core::slice::from_raw_parts(self.data_ptr.add(head_index + 4), len);
                out.extend_from_slice(src);
            }

            self.head
                .store(head.wrapping_add(total as u32), Ordering::Release);
            return Ok(());
        }
    }

    pub fn try_pop(&self) -> Result<Vec<u8>, PopError> {
        let mut out = Vec::new();
        self.try_pop_into(&mut out)?;
        Ok(out)
    }
}

/// Bytes one record with `payload_len` bytes of payload occupies.
pub const fn record_size(payload_len: usize) -> usize {
    align_up(4 + payload_len, RECORD_ALIGN)
}

/// Largest payload a single record may carry in a ring of `capacity_bytes`.
///
/// A record this large only fits when the ring is empty and the tail sits at
/// offset 0; see [`record_size`] for sizing rings that never stall.
pub const fn max_payload_len_for_capacity(capacity_bytes: usize) -> usize {
    capacity_bytes.saturating_sub(4 + (RECORD_ALIGN - 1))
}

const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}

unsafe fn read_u32_le(ptr: *const u8) -> u32 {
    let mut tmp = [0u8; 4];
    core::ptr::copy_nonoverlapping(ptr, tmp.as_mut_ptr(), 4);
    u32::from_le_bytes(tmp)
}

unsafe fn write_u32_le(ptr: *mut u8, v: u32) {
    let bytes = v.to_le_bytes();
    core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, 4);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_must_be_a_power_of_two() {
        assert_eq!(CommandRing::new(0).err(), Some(RingError::BadCapacity(0)));
        assert_eq!(CommandRing::new(18).err(), Some(RingError::BadCapacity(18)));
        assert_eq!(CommandRing::new(96).err(), Some(RingError::BadCapacity(96)));
        assert!(CommandRing::new(64).is_ok());
    }

    #[test]
    fn pop_into_reuses_the_output_buffer() {
        let ring = CommandRing::new(64).unwrap();
        ring.try_push(b"abcdef").unwrap();
        ring.try_push(b"xy").unwrap();

        let mut out = Vec::with_capacity(16);
        ring.try_pop_into(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
        ring.try_pop_into(&mut out).unwrap();
        assert_eq!(out, b"xy");
        assert_eq!(ring.try_pop_into(&mut out), Err(PopError::Empty));
    }

    #[test]
    fn wrap_marker_is_skipped() {
        let ring = CommandRing::new(32).unwrap();
        // 4 + 16 = 20 bytes, leaving 12 at the end.
        ring.try_push(&[1; 16]).unwrap();
        assert_eq!(ring.try_pop().unwrap(), vec![1; 16]);
        // Needs 16 bytes; does not fit in the remaining 12, so it wraps.
        ring.try_push(&[2; 12]).unwrap();
        assert_eq!(ring.try_pop().unwrap(), vec![2; 12]);
        assert!(ring.is_empty());
    }
}
