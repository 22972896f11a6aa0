// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::{iou::EnterFlags, uring_sys};
use std::{fmt, io, os::unix::io::RawFd, ptr::NonNull};

macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) mod uring;
pub(crate) mod write_buffer;

pub(crate) use self::uring::UringEngine;

/// The kernel calls a ring needs over its lifetime.
///
/// Everything above this trait talks to the kernel only through it, so a
/// ring can be driven by an in-memory double in tests.
pub(crate) trait RingSyscalls: fmt::Debug {
    /// Creates a ring of `entries` slots and fills in `params` with its
    /// layout. Returns the ring file descriptor.
    fn setup(&self, entries: u32, params: &mut uring_sys::io_uring_params) -> io::Result<RawFd>;

    /// Maps `len` bytes of the ring region found at `offset`.
    fn map(&self, fd: RawFd, len: usize, offset: u64) -> io::Result<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` and `len` must come from a previous successful call to `map`,
    /// and nothing may reference the region afterwards.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize);

    /// Hands `to_submit` published entries to the kernel and optionally
    /// waits for `min_complete` completions. Returns how many entries the
    /// kernel consumed.
    fn enter(
        &self,
        fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> io::Result<u32>;

    fn close(&self, fd: RawFd);
}

/// The real thing.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Kernel;

impl RingSyscalls for Kernel {
    fn setup(&self, entries: u32, params: &mut uring_sys::io_uring_params) -> io::Result<RawFd> {
        let fd = unsafe { uring_sys::syscalls::io_uring_setup(entries, params) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    fn map(&self, fd: RawFd, len: usize, offset: u64) -> io::Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, len) != 0 {
            log::warn!(
                "munmap of io_uring region failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    fn enter(
        &self,
        fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> io::Result<u32> {
        let ret = unsafe {
            uring_sys::syscalls::io_uring_enter(fd, to_submit, min_complete, flags.bits())
        };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as u32)
        }
    }

    fn close(&self, fd: RawFd) {
        if let Err(err) = syscall!(close(fd)) {
            log::warn!("closing io_uring fd {} failed: {}", fd, err);
        }
    }
}
