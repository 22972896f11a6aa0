use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{self, AtomicU32, Ordering};

use super::Sqe;
use crate::uring_sys;

/// The queue of pending IO events, seen from the producer side.
///
/// We are the only writer of the tail and the kernel the only writer of the
/// head. Every access to either goes through this type so the barriers live
/// in one place.
pub struct SubmissionQueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    array: *mut u32,
    sqes: NonNull<uring_sys::io_uring_sqe>,
}

impl SubmissionQueue {
    /// # Safety
    ///
    /// `ring` must be the mapped submission ring described by `off`, `sqes`
    /// the mapped entry array, and both must outlive the queue.
    pub(crate) unsafe fn new(
        ring: NonNull<u8>,
        sqes: NonNull<uring_sys::io_uring_sqe>,
        off: &uring_sys::io_sqring_offsets,
    ) -> SubmissionQueue {
        let at = |offset: u32| ring.as_ptr().add(offset as usize);
        SubmissionQueue {
            khead: at(off.head) as *const AtomicU32,
            ktail: at(off.tail) as *const AtomicU32,
            ring_mask: ptr::read(at(off.ring_mask) as *const u32),
            ring_entries: ptr::read(at(off.ring_entries) as *const u32),
            array: at(off.array) as *mut u32,
            sqes,
        }
    }

    /// The kernel's consumer index.
    pub fn head(&self) -> u32 {
        unsafe { (*self.khead).load(Ordering::Acquire) }
    }

    /// Our producer index. Nobody else writes it.
    pub fn tail(&self) -> u32 {
        unsafe { (*self.ktail).load(Ordering::Relaxed) }
    }

    pub fn mask(&self) -> u32 {
        self.ring_mask
    }

    pub fn entries(&self) -> u32 {
        self.ring_entries
    }

    /// Published entries the kernel has not consumed yet.
    pub fn pending(&self) -> u32 {
        self.tail().wrapping_sub(self.head())
    }

    pub fn space_left(&self) -> u32 {
        self.ring_entries - self.pending()
    }

    /// Copies `sqe` into the slot at the tail and publishes the new tail.
    /// Returns the new tail, or `None` if the ring is full.
    ///
    /// The entry and its indirection index are fully written before the
    /// tail moves; the kernel must never see a tail that points past a
    /// half-written slot.
    pub fn push(&mut self, sqe: &Sqe) -> Option<u32> {
        if self.space_left() == 0 {
            return None;
        }
        let tail = self.tail();
        let next_tail = tail.wrapping_add(1);
        let index = tail & self.ring_mask;
        unsafe {
            ptr::write(self.sqes.as_ptr().add(index as usize), sqe.to_raw());
            ptr::write_volatile(self.array.add(index as usize), index);
            atomic::fence(Ordering::Release);
            (*self.ktail).store(next_tail, Ordering::Release);
        }
        atomic::fence(Ordering::SeqCst);
        Some(next_tail)
    }
}

impl fmt::Debug for SubmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(std::any::type_name::<Self>())
            .field("head", &self.head())
            .field("tail", &self.tail())
            .field("entries", &self.ring_entries)
            .finish()
    }
}
