use std::mem;
use std::os::unix::io::RawFd;

use crate::uring_sys::{self, IoRingOp};

bitflags::bitflags! {
    /// [`Sqe`] configuration flags.
    pub struct SubmissionFlags: u8 {
        /// Submit this event only after completing all ongoing submission events.
        const IO_DRAIN      = uring_sys::IOSQE_IO_DRAIN;
        /// Force the next submission event to wait until this event has completed successfully.
        ///
        /// An event's link only applies to the next event, but link chains can be
        /// arbitrarily long.
        const IO_LINK       = uring_sys::IOSQE_IO_LINK;
    }
}

/// One operation descriptor, built on our side and copied into a
/// submission slot when published. Never mutated after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sqe {
    opcode: IoRingOp,
    flags: SubmissionFlags,
    fd: RawFd,
    addr: u64,
    len: u32,
    off: u64,
    user_data: u64,
}

impl Sqe {
    /// A no-op. Carries the sentinel token until told otherwise.
    pub fn nop() -> Sqe {
        Sqe {
            opcode: IoRingOp::IORING_OP_NOP,
            flags: SubmissionFlags::empty(),
            fd: -1,
            addr: 0,
            len: 0,
            off: 0,
            user_data: uring_sys::NOP_USER_DATA,
        }
    }

    /// A vectored write of `nr_vecs` iovecs starting at `iovecs`.
    ///
    /// The iovec array and every buffer it points to must stay valid until
    /// the matching completion has been reaped.
    pub fn writev(fd: RawFd, iovecs: *const libc::iovec, nr_vecs: u32) -> Sqe {
        Sqe {
            opcode: IoRingOp::IORING_OP_WRITEV,
            flags: SubmissionFlags::empty(),
            fd,
            addr: iovecs as u64,
            len: nr_vecs,
            off: 0,
            user_data: uring_sys::NOP_USER_DATA,
        }
    }

    pub fn with_flags(mut self, flags: SubmissionFlags) -> Sqe {
        self.flags = flags;
        self
    }

    pub fn with_user_data(mut self, user_data: u64) -> Sqe {
        self.user_data = user_data;
        self
    }

    pub fn opcode(&self) -> IoRingOp {
        self.opcode
    }

    pub fn flags(&self) -> SubmissionFlags {
        self.flags
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Number of iovecs for vectored operations.
    pub fn iovec_count(&self) -> u32 {
        self.len
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The bit-exact kernel layout. Unused fields are zero.
    pub(crate) fn to_raw(&self) -> uring_sys::io_uring_sqe {
        let mut raw: uring_sys::io_uring_sqe = unsafe { mem::zeroed() };
        raw.opcode = self.opcode as u8;
        raw.flags = self.flags.bits();
        raw.fd = self.fd;
        raw.off_addr2 = uring_sys::off_addr2 { off: self.off };
        raw.addr = self.addr;
        raw.len = self.len;
        raw.user_data = self.user_data;
        raw
    }
}
