//! Generation-checked slot storage for ledger records.
//!
//! Every slot carries a generation counter which is bumped when its record is removed. A key
//! remembers the generation it was issued with, so a key kept past its record's removal no
//! longer matches, even after the slot has been reused.
//!
//! Each arena also draws a process-unique id, stamped into every key it issues. A key handed to
//! a different arena (another context's ledger) never matches, whatever its index.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_ARENA_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct Key {
    arena: u32,
    index: u32,
    generation: u32,
}
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct Arena<T> {
    id: u32,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}
impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Arena {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, value: T) -> Key {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                debug_assert!(slot.value.is_none());
                slot.value = Some(value);
                Key {
                    arena: self.id,
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                Key {
                    arena: self.id,
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn owns(&self, key: Key) -> bool {
        key.arena == self.id
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        if !self.owns(key) {
            return None;
        }
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        if !self.owns(key) {
            return None;
        }
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        if !self.owns(key) {
            return None;
        }
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        let arena = self.id;
        self.slots.iter().enumerate().filter_map(move |(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Key {
                        arena,
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stale_key_is_rejected_after_reuse() {
        let mut arena = Arena::new();
        let first = arena.insert("first");
        assert_eq!(Some("first"), arena.remove(first));

        let second = arena.insert("second");
        assert_eq!(None, arena.get(first));
        assert_eq!(None, arena.remove(first));
        assert_eq!(Some(&"second"), arena.get(second));
        assert_eq!(1, arena.len());
    }

    #[test]
    fn test_iter_skips_vacant_slots() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        let c = arena.insert(3);
        assert_eq!(Some(2), arena.remove(b));

        let keys: Vec<Key> = arena.iter().map(|(key, _)| key).collect();
        assert_eq!(vec![a, c], keys);
    }

    #[test]
    fn test_key_from_other_arena_is_rejected() {
        let mut first = Arena::new();
        let mut second = Arena::new();
        let foreign = first.insert("first");
        let own = second.insert("second");

        // Same slot and generation, different arena.
        assert_eq!(None, second.get(foreign));
        assert_eq!(None, second.get_mut(foreign));
        assert_eq!(None, second.remove(foreign));
        assert_eq!(Some(&"second"), second.get(own));
        assert_eq!(Some(&"first"), first.get(foreign));
    }
}
