use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU32, Ordering};

use super::Cqe;
use crate::uring_sys;

/// The queue of completed IO events, seen from the consumer side.
///
/// Completion does not imply success. The kernel writes the tail, we write
/// the head.
pub struct CompletionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    koverflow: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    cqes: *const uring_sys::io_uring_cqe,
}

impl CompletionQueue {
    /// # Safety
    ///
    /// `ring` must be the mapped completion ring described by `off` and must
    /// outlive the queue.
    pub(crate) unsafe fn new(
        ring: NonNull<u8>,
        off: &uring_sys::io_cqring_offsets,
    ) -> CompletionQueue {
        let at = |offset: u32| ring.as_ptr().add(offset as usize);
        CompletionQueue {
            khead: at(off.head) as *const AtomicU32,
            ktail: at(off.tail) as *const AtomicU32,
            koverflow: at(off.overflow) as *const AtomicU32,
            ring_mask: ptr::read(at(off.ring_mask) as *const u32),
            ring_entries: ptr::read(at(off.ring_entries) as *const u32),
            cqes: at(off.cqes) as *const uring_sys::io_uring_cqe,
        }
    }

    /// Our consumer index. Nobody else writes it.
    pub fn head(&self) -> u32 {
        unsafe { (*self.khead).load(Ordering::Relaxed) }
    }

    /// The kernel's producer index. Entries below it are fully written.
    pub fn tail(&self) -> u32 {
        unsafe { (*self.ktail).load(Ordering::Acquire) }
    }

    pub fn mask(&self) -> u32 {
        self.ring_mask
    }

    pub fn entries(&self) -> u32 {
        self.ring_entries
    }

    pub fn ready(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    /// Completions the kernel had to drop because the ring was full.
    pub fn overflow(&self) -> u32 {
        unsafe { (*self.koverflow).load(Ordering::Relaxed) }
    }

    /// Copies out the entry at index `at`. The caller must have observed a
    /// tail past `at`.
    pub fn entry(&self, at: u32) -> Cqe {
        let raw = unsafe { ptr::read_volatile(self.cqes.add((at & self.ring_mask) as usize)) };
        Cqe::from_raw(raw)
    }

    /// Hands every slot below `head` back to the kernel.
    pub fn publish_head(&mut self, head: u32) {
        unsafe { (*self.khead).store(head, Ordering::Release) };
        atomic::fence(Ordering::SeqCst);
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("entries", &self.ring_entries)
            .finish()
    }
}
