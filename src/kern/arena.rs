//! Generational arena
//!
//! Fixed-size slots recycled through a free list, in the spirit of a zone
//! allocator. Keys carry a generation drawn from a global counter, so a key
//! kept past its element's removal (or past a scheduler reset) never aliases
//! a newer element.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::error::{KResult, KernError};

static NEXT_GENERATION: AtomicU32 = AtomicU32::new(1);

/// Handle to an arena element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaKey {
    index: u32,
    generation: u32,
}

impl ArenaKey {
    /// Pack into a non-zero integer, for storage in an atomic
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`ArenaKey::to_raw`]; zero means "no key"
    pub const fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            return None;
        }
        Some(Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        })
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab of `T` addressed by [`ArenaKey`]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert, reporting allocation failure instead of aborting
    pub fn try_insert(&mut self, value: T) -> KResult<ArenaKey> {
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = generation;
                slot.value = Some(value);
                index
            }
            None => {
                self.slots.try_reserve(1).map_err(|_| KernError::NoMemory)?;
                self.free.try_reserve(self.slots.len() + 1 - self.free.len())
                    .map_err(|_| KernError::NoMemory)?;
                self.slots.push(Slot {
                    generation,
                    value: Some(value),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.len += 1;
        Ok(ArenaKey { index, generation })
    }

    /// Insert; allocation failure is fatal
    pub fn insert(&mut self, value: T) -> ArenaKey {
        match self.try_insert(value) {
            Ok(key) => key,
            Err(_) => crate::kpanic!("arena: out of memory"),
        }
    }

    pub fn remove(&mut self, key: ArenaKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        // Capacity was reserved at insertion.
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, key: ArenaKey) -> Option<&T> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, key: ArenaKey) -> Option<&mut T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn contains(&self, key: ArenaKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_key_does_not_alias() {
        let mut arena = Arena::new();
        let old = arena.insert(1);
        arena.remove(old);
        let new = arena.insert(2);
        // Same slot, new generation
        assert_eq!(old.index, new.index);
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.remove(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn test_raw_round_trip() {
        let mut arena = Arena::new();
        let key = arena.insert(());
        assert_ne!(key.to_raw(), 0);
        assert_eq!(ArenaKey::from_raw(key.to_raw()), Some(key));
        assert_eq!(ArenaKey::from_raw(0), None);
    }
}
