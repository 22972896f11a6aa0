// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{marker::PhantomData, mem};

/// A handle into a [`FreeList`]. The generation makes a handle that outlived
/// its slot fail lookups instead of aliasing whatever reused the slot.
#[derive(Debug)]
pub(crate) struct Idx<T> {
    raw: usize,
    generation: u32,
    _ty: PhantomData<fn() -> T>,
}

impl<T> Copy for Idx<T> {}
impl<T> Clone for Idx<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Idx<T> {
    fn eq(&self, other: &Idx<T>) -> bool {
        self.raw == other.raw && self.generation == other.generation
    }
}
impl<T> Eq for Idx<T> {}

impl<T> Idx<T> {
    pub(crate) fn from_raw(raw: usize, generation: u32) -> Idx<T> {
        Idx {
            raw,
            generation,
            _ty: PhantomData,
        }
    }
    pub(crate) fn to_raw(self) -> usize {
        self.raw
    }
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
pub(crate) struct FreeList<T> {
    first_free: Option<usize>,
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T> Default for FreeList<T> {
    fn default() -> Self {
        FreeList::with_capacity(8 << 10)
    }
}

impl<T> FreeList<T> {
    pub(crate) fn with_capacity(cap: usize) -> FreeList<T> {
        FreeList {
            first_free: None,
            slots: Vec::with_capacity(cap),
            live: 0,
        }
    }

    pub(crate) fn alloc(&mut self, item: T) -> Idx<T> {
        self.live += 1;
        match self.first_free {
            Some(raw) => {
                let generation = match &self.slots[raw] {
                    Slot::Free {
                        next_free,
                        generation,
                    } => {
                        self.first_free = *next_free;
                        *generation
                    }
                    Slot::Full { .. } => unreachable!(),
                };
                self.slots[raw] = Slot::Full { item, generation };
                Idx::from_raw(raw, generation)
            }
            None => {
                let raw = self.slots.len();
                self.slots.push(Slot::Full {
                    item,
                    generation: 0,
                });
                Idx::from_raw(raw, 0)
            }
        }
    }

    /// Removes the item `idx` points to. Returns `None` when the handle is
    /// stale or was never issued by this list.
    pub(crate) fn dealloc(&mut self, idx: Idx<T>) -> Option<T> {
        match self.slots.get(idx.to_raw()) {
            Some(Slot::Full { generation, .. }) if *generation == idx.generation() => {}
            _ => return None,
        }
        let slot = Slot::Free {
            next_free: mem::replace(&mut self.first_free, Some(idx.to_raw())),
            generation: idx.generation().wrapping_add(1),
        };
        self.live -= 1;
        match mem::replace(&mut self.slots[idx.to_raw()], slot) {
            Slot::Full { item, .. } => Some(item),
            Slot::Free { .. } => unreachable!(),
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, idx: Idx<T>) -> Option<&T> {
        match self.slots.get(idx.to_raw()) {
            Some(Slot::Full { item, generation }) if *generation == idx.generation() => Some(item),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[derive(Debug)]
enum Slot<T> {
    Free {
        next_free: Option<usize>,
        generation: u32,
    },
    Full {
        item: T,
        generation: u32,
    },
}

#[test]
fn free_list_smoke_test() {
    let mut free_list: FreeList<&str> = FreeList::default();

    let hello = free_list.alloc("hello");
    assert_eq!(hello, Idx::from_raw(0, 0));

    let world = free_list.alloc("world");
    assert_eq!(world, Idx::from_raw(1, 0));

    assert_eq!(free_list.get(hello), Some(&"hello"));
    assert_eq!(free_list.get(world), Some(&"world"));
    assert_eq!(free_list.len(), 2);

    assert_eq!(free_list.dealloc(hello), Some("hello"));

    let goodbye = free_list.alloc("goodbye");
    assert_eq!(goodbye, Idx::from_raw(0, 1));

    free_list.dealloc(goodbye);
    free_list.dealloc(world);
    assert!(free_list.is_empty());

    let a = free_list.alloc("a");
    let b = free_list.alloc("b");
    let c = free_list.alloc("c");
    assert_eq!(a, Idx::from_raw(1, 1));
    assert_eq!(b, Idx::from_raw(0, 2));
    assert_eq!(c, Idx::from_raw(2, 0));
}

#[test]
fn stale_handles_miss() {
    let mut free_list: FreeList<u32> = FreeList::with_capacity(4);

    let first = free_list.alloc(1);
    assert_eq!(free_list.dealloc(first), Some(1));
    assert_eq!(free_list.dealloc(first), None);

    let second = free_list.alloc(2);
    assert_eq!(second.to_raw(), first.to_raw());
    assert_eq!(free_list.get(first), None);
    assert_eq!(free_list.dealloc(first), None);
    assert_eq!(free_list.get(second), Some(&2));

    assert_eq!(free_list.dealloc(Idx::from_raw(17, 0)), None);
    assert_eq!(free_list.len(), 1);
}
