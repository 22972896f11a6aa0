// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020
// Datadog, Inc.
//
//! # uring_writer - the write path of an event loop, on raw `io_uring`.
//!
//! ## What is uring_writer
//!
//! uring_writer hands outbound writes of a single-threaded network server to
//! the kernel through an `io_uring` it sets up and maps itself. No library
//! sits in between: the crate issues the setup and enter system calls,
//! manages the shared rings with explicit memory ordering and keeps every
//! buffer alive until the kernel reports it is done with it.
//!
//! This library depends on linux's `io_uring` interface, so this is
//! Linux-only, with a kernel version 5.6 or newer recommended.
//!
//! ## The loop contract
//!
//! The embedding event loop calls, on every iteration:
//!
//! 1. [`UringWriter::start_of_loop`], which reaps the completions of earlier
//!    writes and releases their buffers;
//! 2. [`UringWriter::submit_write`] for every outbound buffer;
//! 3. [`UringWriter::write_done`] once per connection written to;
//! 4. [`UringWriter::end_of_loop`].
//!
//! Writes to the same connection are linked, so the kernel executes them in
//! submission order. With pipelining on, each iteration ends with a drain
//! barrier, so no write of the next iteration starts before every write of
//! this one completed.
//!
//! ## Modes
//!
//! * **default**: each write enters the kernel right away, without waiting.
//! * **blocking**: each write waits for its own completion.
//! * **batching**: entries accumulate and are handed over in one enter at the
//!   end of the iteration.
//!
//! ## Example
//!
//! ```no_run
//! use uring_writer::{Connection, UringWriter};
//!
//! let mut writer = UringWriter::new();
//! writer.init_with_modes(true, false, true).unwrap();
//!
//! let stdout = Connection::from_fd(1);
//! writer.start_of_loop().unwrap();
//! writer.submit_write(stdout, b"hello, ring\n").unwrap();
//! writer.write_done(stdout).unwrap();
//! writer.end_of_loop().unwrap();
//!
//! for fault in writer.take_faults() {
//!     eprintln!("{}", fault);
//! }
//! ```
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(doc, deny(rustdoc::broken_intra_doc_links))]

mod free_list;

#[allow(dead_code)]
#[allow(clippy::upper_case_acronyms)]
mod iou;
mod sys;

#[allow(dead_code)]
#[allow(non_camel_case_types)]
#[allow(clippy::upper_case_acronyms)]
mod uring_sys;

mod error;
mod ordering;
mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

use std::os::unix::io::RawFd;

pub use crate::{
    error::{CompletionFault, Result, RingRegion, WriterError},
    ordering::WriteMode,
    sys::write_buffer::{BufferAllocator, BufferKind, SystemAllocator},
    writer::{UringWriter, WriterBuilder, DEFAULT_BLOCK_SIZE, DEFAULT_RING_DEPTH},
};

/// The destination of a write: a file descriptor plus an opaque value
/// owned by the embedding server. The writer never interprets
/// `private_data`; it hands it back in [`CompletionFault`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    fd: RawFd,
    private_data: usize,
}

impl Connection {
    /// A connection writing to `fd`, tagged with `private_data`.
    pub fn new(fd: RawFd, private_data: usize) -> Connection {
        Connection { fd, private_data }
    }

    /// A connection with no private data.
    pub fn from_fd(fd: RawFd) -> Connection {
        Connection::new(fd, 0)
    }

    /// The file descriptor writes go to.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The value given at creation.
    pub fn private_data(&self) -> usize {
        self.private_data
    }
}

/// Counters of what a [`UringWriter`] did since it was initialized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RingStats {
    // Submission side
    pub(crate) write_calls: u64,
    pub(crate) setup_calls: u64,
    pub(crate) enter_calls: u64,
    pub(crate) enter_requested: u64,
    pub(crate) enter_failures: u64,
    pub(crate) entries_published: u64,
    pub(crate) batches_flushed: u64,

    // Completion side
    pub(crate) writes_completed: u64,
    pub(crate) nops_completed: u64,
    pub(crate) bytes_completed: u64,
    pub(crate) faults: u64,
    pub(crate) completions_dropped: u64,
}

impl RingStats {
    /// Calls to [`UringWriter::submit_write`], including rejected ones.
    pub fn write_calls(&self) -> u64 {
        self.write_calls
    }

    /// Rings created.
    pub fn setup_calls(&self) -> u64 {
        self.setup_calls
    }

    /// Enter system calls issued.
    pub fn enter_calls(&self) -> u64 {
        self.enter_calls
    }

    /// Entries the kernel accepted through enter calls.
    pub fn enter_requested(&self) -> u64 {
        self.enter_requested
    }

    /// Enter calls that failed or consumed fewer entries than asked. The
    /// entries left behind go out with the next enter.
    pub fn enter_failures(&self) -> u64 {
        self.enter_failures
    }

    /// Entries written into the submission ring, no-ops included.
    pub fn entries_published(&self) -> u64 {
        self.entries_published
    }

    /// Batches handed to the kernel at the end of an iteration.
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed
    }

    /// Write completions reaped, successful or not.
    pub fn writes_completed(&self) -> u64 {
        self.writes_completed
    }

    /// No-op completions reaped.
    pub fn nops_completed(&self) -> u64 {
        self.nops_completed
    }

    /// Bytes the kernel reported as written.
    pub fn bytes_completed(&self) -> u64 {
        self.bytes_completed
    }

    /// [`CompletionFault`]s recorded.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Completions the kernel could not post because the completion ring
    /// was full. The writes they belong to are never released.
    pub fn completions_dropped(&self) -> u64 {
        self.completions_dropped
    }
}
