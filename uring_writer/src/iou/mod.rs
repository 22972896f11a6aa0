//! Direct bindings to the kernel's `io_uring` rings.
//!
//! No library sits between us and the kernel here. [`Rings::setup`] asks the
//! kernel for a ring, maps the shared submission and completion regions, and
//! hands out a [`SubmissionQueue`] and a [`CompletionQueue`] that wrap every
//! access to the shared indices.
//!
//! # Submitting events
//!
//! An [`Sqe`] is built on our side and copied into the ring by
//! [`SubmissionQueue::push`]. The kernel only sees it after [`Rings::enter`]
//! is called for it. The buffers an event points to must stay alive until
//! its [`Cqe`] has been read back.
use crate::{
    error::{ErrorEnhancer, RingRegion, WriterError},
    sys::RingSyscalls,
    uring_sys,
};

/// Types related to completion queue events.
pub mod cqe;
/// Types related to submission queue events.
pub mod sqe;

mod completion_queue;
mod submission_queue;

use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::rc::Rc;

#[doc(inline)]
pub use cqe::Cqe;
#[doc(inline)]
pub use sqe::{Sqe, SubmissionFlags};

pub use completion_queue::CompletionQueue;
pub use submission_queue::SubmissionQueue;

bitflags::bitflags! {
    /// Features the kernel reports back when a ring is created.
    pub struct SetupFeatures: u32 {
        /// Both rings' control structures live in one mapping.
        const SINGLE_MMAP = uring_sys::IORING_FEAT_SINGLE_MMAP;
    }
}

bitflags::bitflags! {
    /// Flags for [`Rings::enter`].
    pub struct EnterFlags: u32 {
        /// Wait for `min_complete` completions before returning.
        const GETEVENTS = uring_sys::IORING_ENTER_GETEVENTS;
    }
}

/// A region of ring memory shared with the kernel.
struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
    syscalls: Rc<dyn RingSyscalls>,
}

impl Mmap {
    fn new(
        syscalls: &Rc<dyn RingSyscalls>,
        fd: RawFd,
        len: usize,
        offset: u64,
        region: RingRegion,
    ) -> Result<Mmap, WriterError> {
        match syscalls.map(fd, len, offset) {
            Ok(ptr) => Ok(Mmap {
                ptr,
                len,
                syscalls: syscalls.clone(),
            }),
            Err(inner) => Err(WriterError::Map {
                region,
                source: ErrorEnhancer {
                    inner,
                    op: "mmap",
                    fd: Some(fd),
                }
                .into(),
            }),
        }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        unsafe { self.syscalls.unmap(self.ptr, self.len) }
    }
}

struct RingFd {
    fd: RawFd,
    syscalls: Rc<dyn RingSyscalls>,
}

impl Drop for RingFd {
    fn drop(&mut self) {
        self.syscalls.close(self.fd);
    }
}

/// A mapped submission/completion ring pair.
///
/// Dropping it unmaps every region and then closes the ring.
pub struct Rings {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    features: SetupFeatures,
    // Field order is drop order: unmap everything before closing the fd.
    _sqes: Mmap,
    _cq_ring: Option<Mmap>,
    _sq_ring: Mmap,
    fd: RingFd,
}

impl Rings {
    /// Creates a ring with room for `depth` submissions and maps it.
    ///
    /// When the kernel offers [`SetupFeatures::SINGLE_MMAP`] both rings'
    /// control structures share one mapping. The submission entry array is
    /// always mapped on its own.
    pub(crate) fn setup(depth: u32, syscalls: Rc<dyn RingSyscalls>) -> Result<Rings, WriterError> {
        let mut params = uring_sys::io_uring_params::default();
        let fd = syscalls.setup(depth, &mut params).map_err(|inner| {
            WriterError::Setup(
                ErrorEnhancer {
                    inner,
                    op: "io_uring_setup",
                    fd: None,
                }
                .into(),
            )
        })?;
        let fd = RingFd {
            fd,
            syscalls: syscalls.clone(),
        };

        let features = SetupFeatures::from_bits_truncate(params.features);
        let single_mmap = features.contains(SetupFeatures::SINGLE_MMAP);

        let mut sq_ring_len =
            params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>();
        let mut cq_ring_len = params.cq_off.cqes as usize
            + params.cq_entries as usize * size_of::<uring_sys::io_uring_cqe>();
        if single_mmap {
            sq_ring_len = sq_ring_len.max(cq_ring_len);
            cq_ring_len = sq_ring_len;
        }

        let sq_ring = Mmap::new(
            &syscalls,
            fd.fd,
            sq_ring_len,
            uring_sys::IORING_OFF_SQ_RING,
            RingRegion::SubmissionRing,
        )?;
        let cq_ring = if single_mmap {
            None
        } else {
            Some(Mmap::new(
                &syscalls,
                fd.fd,
                cq_ring_len,
                uring_sys::IORING_OFF_CQ_RING,
                RingRegion::CompletionRing,
            )?)
        };
        let sqes = Mmap::new(
            &syscalls,
            fd.fd,
            params.sq_entries as usize * size_of::<uring_sys::io_uring_sqe>(),
            uring_sys::IORING_OFF_SQES,
            RingRegion::SubmissionEntries,
        )?;

        let cq_base = cq_ring.as_ref().map_or(sq_ring.ptr, |map| map.ptr);
        let sq = unsafe { SubmissionQueue::new(sq_ring.ptr, sqes.ptr.cast(), &params.sq_off) };
        let cq = unsafe { CompletionQueue::new(cq_base, &params.cq_off) };

        tracing::trace!(
            fd = fd.fd,
            sq_entries = sq.entries(),
            cq_entries = cq.entries(),
            single_mmap,
            "io_uring rings mapped"
        );

        Ok(Rings {
            sq,
            cq,
            features,
            _sqes: sqes,
            _cq_ring: cq_ring,
            _sq_ring: sq_ring,
            fd,
        })
    }

    pub fn sq(&self) -> &SubmissionQueue {
        &self.sq
    }

    pub fn sq_mut(&mut self) -> &mut SubmissionQueue {
        &mut self.sq
    }

    pub fn cq(&self) -> &CompletionQueue {
        &self.cq
    }

    pub fn cq_mut(&mut self) -> &mut CompletionQueue {
        &mut self.cq
    }

    pub fn fd(&self) -> RawFd {
        self.fd.fd
    }

    pub fn features(&self) -> SetupFeatures {
        self.features
    }

    /// Tells the kernel about `to_submit` published entries, waiting for
    /// `min_complete` completions if `flags` asks for it.
    pub fn enter(&self, to_submit: u32, min_complete: u32, flags: EnterFlags) -> io::Result<u32> {
        self.fd
            .syscalls
            .enter(self.fd.fd, to_submit, min_complete, flags)
    }
}

impl fmt::Debug for Rings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rings")
            .field("fd", &self.fd.fd)
            .field("features", &self.features)
            .field("sq", &self.sq)
            .field("cq", &self.cq)
            .finish()
    }
}
