//! Generational slot arrays backing every CM object table.
//!
//! A table is a `Vec` of slots, each holding a generation counter and an
//! optional value. Handles carry both the slot index and the generation the
//! slot had when the object was stored, so a handle to a destroyed object
//! can never reach whatever later reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use md_common::{CmError, CmResult};

/// Typed handle into a [`SlotArray<T>`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index in the owning table.
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Bounded object table with first-free-slot allocation.
pub struct SlotArray<T> {
    kind: &'static str,
    slots: Vec<Slot<T>>,
    max_len: u32,
    live: usize,
}

impl<T> SlotArray<T> {
    /// `kind` names the object class in errors and logs.
    pub fn new(kind: &'static str, max_len: u32) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            max_len,
            live: 0,
        }
    }

    /// Store `value` in the first free slot, growing the table if every
    /// existing slot is taken. Gives the value back when the table is full.
    pub fn insert(&mut self, value: T) -> Result<Handle<T>, T> {
        let index = match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => index,
            None if (self.slots.len() as u32) < self.max_len => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                self.slots.len() - 1
            }
            None => return Err(value),
        };
        let slot = &mut self.slots[index];
        slot.value = Some(value);
        self.live += 1;
        Ok(Handle::new(index as u32, slot.generation))
    }

    /// Index the next `insert` would use, if there is room.
    pub fn first_free_index(&self) -> Option<u32> {
        match self.slots.iter().position(|s| s.value.is_none()) {
            Some(index) => Some(index as u32),
            None if (self.slots.len() as u32) < self.max_len => Some(self.slots.len() as u32),
            None => None,
        }
    }

    pub fn get(&self, handle: Handle<T>) -> CmResult<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
            .ok_or(self.stale(handle))
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> CmResult<&mut T> {
        let err = self.stale(handle);
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
            .ok_or(err)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_ok()
    }

    /// Take the value out of its slot. The slot's generation is bumped so
    /// `handle` and any copies of it are stale from now on.
    pub fn remove(&mut self, handle: Handle<T>) -> CmResult<T> {
        let err = self.stale(handle);
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.value.is_some())
            .ok_or(err)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        slot.value.take().ok_or(CmError::InconsistentHandle {
            kind: self.kind,
            index: handle.index,
        })
    }

    /// Remove every live value, in slot order.
    pub fn drain(&mut self) -> Vec<(Handle<T>, T)> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                out.push((Handle::new(index as u32, slot.generation), value));
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.live = 0;
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|v| (Handle::new(index as u32, slot.generation), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle<T>, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.value
                .as_mut()
                .map(|v| (Handle::new(index as u32, generation), v))
        })
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots allocated so far, live or free.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn max_len(&self) -> u32 {
        self.max_len
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn stale(&self, handle: Handle<T>) -> CmError {
        CmError::InconsistentHandle {
            kind: self.kind,
            index: handle.index,
        }
    }
}

impl<T> fmt::Debug for SlotArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotArray")
            .field("kind", &self.kind)
            .field("live", &self.live)
            .field("slots", &self.slots.len())
            .field("max_len", &self.max_len)
            .finish()
    }
}
