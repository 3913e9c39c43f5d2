//! Generational slot allocator, one per object type.
//!
//! The client allocates handles; the server mirrors them with
//! [`ObjectTable::insert`]. Both sides bump a slot's generation when the
//! object is freed, so the same sequence of commands keeps the two tables in
//! lockstep and a handle to a previous tenant never resolves again.

use crate::error::TableError;
use crate::handle::ObjectHandle;

#[derive(Debug)]
struct Slot<T> {
    /// Generation of the current (or next) tenant.
    generation: u32,
    payload: Option<T>,
}

/// Result of resolving a handle that may be out of date.
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup<T> {
    Live(T),
    /// The id was issued but the handle's tenant has been freed.
    Stale,
    /// The id (or this generation of it) was never issued.
    Unknown,
}

#[derive(Debug)]
pub struct ObjectTable<T> {
    // Slot 0 is the null object and never holds a payload.
    slots: Vec<Slot<T>>,
    free_ids: Vec<u32>,
    live: usize,
}

impl<T> Default for ObjectTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectTable<T> {
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                generation: 0,
                payload: None,
            }],
            free_ids: Vec::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Reserves a slot for `payload`, reusing freed ids first.
    pub fn allocate(&mut self, payload: T) -> ObjectHandle {
        self.live += 1;
        if let Some(id) = self.free_ids.pop() {
            let slot = &mut self.slots[id as usize];
            debug_assert!(slot.payload.is_none());
            slot.payload = Some(payload);
            return ObjectHandle::new(id, slot.generation);
        }

        let id = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            payload: Some(payload),
        });
        ObjectHandle::new(id, 1)
    }

    /// Places `payload` at a handle chosen by the peer.
    ///
    /// The slot must be free and expect exactly `handle.generation`. New ids
    /// must arrive in allocation order, one past the highest id seen so far.
    pub fn insert(&mut self, handle: ObjectHandle, payload: T) -> Result<(), TableError> {
        if handle.is_null() {
            return Err(TableError::Null(handle));
        }

        let index = handle.id as usize;
        if index > self.slots.len() {
            return Err(TableError::OutOfSequence {
                handle,
                next: self.slots.len() as u32,
            });
        }
        if index == self.slots.len() {
            // Fresh ids start at generation 1; check before growing so a
            // rejected insert leaves the table as it was.
            if handle.generation != 1 {
                return Err(TableError::GenerationMismatch {
                    handle,
                    expected: 1,
                });
            }
            self.slots.push(Slot {
                generation: 1,
                payload: None,
            });
        }

        let slot = &mut self.slots[index];
        if slot.payload.is_some() {
            return Err(TableError::AlreadyAllocated { handle });
        }
        if slot.generation != handle.generation {
            return Err(TableError::GenerationMismatch {
                handle,
                expected: slot.generation,
            });
        }

        slot.payload = Some(payload);
        self.live += 1;
        if let Some(pos) = self.free_ids.iter().position(|&id| id == handle.id) {
            self.free_ids.swap_remove(pos);
        }
        Ok(())
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        let slot = self.slots.get(handle.id as usize)?;
        if handle.is_null() || slot.generation != handle.generation {
            return None;
        }
        slot.payload.as_ref()
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.payload.as_mut()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Like [`get`](Self::get) but tells a dead tenant apart from a handle
    /// that was never issued.
    pub fn lookup(&self, handle: ObjectHandle) -> Lookup<&T> {
        self.classify(handle, |slot| slot.payload.as_ref())
    }

    pub fn lookup_mut(&mut self, handle: ObjectHandle) -> Lookup<&mut T> {
        if handle.is_null() {
            return Lookup::Unknown;
        }
        let Some(slot) = self.slots.get_mut(handle.id as usize) else {
            return Lookup::Unknown;
        };
        if handle.generation > slot.generation || handle.generation == 0 {
            return Lookup::Unknown;
        }
        match slot.payload.as_mut() {
            Some(payload) if slot.generation == handle.generation => Lookup::Live(payload),
            _ => Lookup::Stale,
        }
    }

    fn classify<'a, R>(
        &'a self,
        handle: ObjectHandle,
        payload: impl FnOnce(&'a Slot<T>) -> Option<R>,
    ) -> Lookup<R> {
        if handle.is_null() {
            return Lookup::Unknown;
        }
        let Some(slot) = self.slots.get(handle.id as usize) else {
            return Lookup::Unknown;
        };
        // Generations only grow (modulo wrap), so a newer one was never handed out.
        if handle.generation > slot.generation || handle.generation == 0 {
            return Lookup::Unknown;
        }
        if slot.generation != handle.generation {
            return Lookup::Stale;
        }
        match payload(slot) {
            Some(p) => Lookup::Live(p),
            None => Lookup::Stale,
        }
    }

    /// Frees a live object and returns its payload. The slot's generation
    /// moves on so `handle` never resolves again.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<T, TableError> {
        if handle.is_null() {
            return Err(TableError::Null(handle));
        }
        let slot = self
            .slots
            .get_mut(handle.id as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(TableError::NotLive(handle))?;
        let payload = slot.payload.take().ok_or(TableError::NotLive(handle))?;

        slot.generation = next_generation(slot.generation);
        self.free_ids.push(handle.id);
        self.live -= 1;
        Ok(payload)
    }

    /// Live objects in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            let payload = slot.payload.as_ref()?;
            Some((ObjectHandle::new(id as u32, slot.generation), payload))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut T)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(id, slot)| {
            let generation = slot.generation;
            let payload = slot.payload.as_mut()?;
            Some((ObjectHandle::new(id as u32, generation), payload))
        })
    }

    /// Handles of live objects matching `pred`, ascending by id.
    pub fn handles_where(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<ObjectHandle> {
        self.iter()
            .filter(|(_, payload)| pred(payload))
            .map(|(handle, _)| handle)
            .collect()
    }
}

fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        g => g,
    }
}
