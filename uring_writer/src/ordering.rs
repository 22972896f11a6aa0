// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Ordering of writes within and across loop iterations.
//!
//! Writes to one connection are linked so the kernel runs them in issue
//! order. The chain is cut with a plain no-op once the connection is done
//! for the iteration, and the iteration itself is closed with a barrier
//! no-op, which drains everything before it when pipelining.
use crate::iou::{Sqe, SubmissionFlags};
use std::mem;

/// How writes are handed to the kernel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteMode {
    batching: bool,
    blocking: bool,
    pipelining: bool,
}

impl WriteMode {
    /// Creates a mode from its three switches.
    pub fn new(batching: bool, blocking: bool, pipelining: bool) -> WriteMode {
        WriteMode {
            batching,
            blocking,
            pipelining,
        }
    }

    /// Entries are only handed to the kernel at the end of each loop.
    pub fn batching(&self) -> bool {
        self.batching
    }

    /// Each write waits for its own completion. Ignored while batching.
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// Loop barriers drain every earlier entry before later ones start.
    pub fn pipelining(&self) -> bool {
        self.pipelining
    }

    /// Whether writes can be outstanding together, and so need chaining.
    pub fn links_writes(&self) -> bool {
        self.batching || !self.blocking
    }
}

/// Per-iteration bookkeeping.
///
/// `chain_len` resets on every chain break, `submitted_in_loop` when the
/// loop barrier goes in, and the deferred counters whenever the entries they
/// count are handed to the kernel.
#[derive(Debug, Default)]
pub(crate) struct LoopContext {
    chain_len: usize,
    submitted_in_loop: usize,
    extra_entries: u32,
    batch_size: u32,
    batch_num: u64,
}

impl LoopContext {
    /// Flags for the next write, which is counted toward the current chain
    /// and loop when writes are linked.
    pub(crate) fn link_write(&mut self, mode: WriteMode) -> SubmissionFlags {
        if mode.links_writes() {
            self.submitted_in_loop += 1;
            self.chain_len += 1;
            SubmissionFlags::IO_LINK
        } else {
            SubmissionFlags::empty()
        }
    }

    /// The unlinked no-op that ends a connection's chain, if chains exist.
    pub(crate) fn chain_break(&self, mode: WriteMode) -> Option<Sqe> {
        if mode.links_writes() {
            Some(Sqe::nop())
        } else {
            None
        }
    }

    /// Returns the length of the chain that was just cut.
    pub(crate) fn chain_broken(&mut self) -> usize {
        mem::take(&mut self.chain_len)
    }

    /// The no-op closing this iteration, if anything was written in it.
    pub(crate) fn loop_barrier(&self, mode: WriteMode) -> Option<Sqe> {
        if mode.links_writes() && self.submitted_in_loop > 0 {
            let flags = if mode.pipelining() {
                SubmissionFlags::IO_DRAIN
            } else {
                SubmissionFlags::empty()
            };
            Some(Sqe::nop().with_flags(flags))
        } else {
            None
        }
    }

    pub(crate) fn barrier_inserted(&mut self) {
        self.submitted_in_loop = 0;
    }

    /// Accounts for `count` published entries whose enter is postponed.
    pub(crate) fn defer(&mut self, mode: WriteMode, count: u32) {
        if mode.batching() {
            self.batch_size += count;
        } else {
            self.extra_entries += count;
        }
    }

    pub(crate) fn take_extra(&mut self) -> u32 {
        mem::take(&mut self.extra_entries)
    }

    /// Closes the current batch. Returns its sequence number and size, or
    /// `None` if nothing is waiting.
    pub(crate) fn take_batch(&mut self) -> Option<(u64, u32)> {
        if self.batch_size == 0 {
            return None;
        }
        self.batch_num += 1;
        Some((self.batch_num, mem::take(&mut self.batch_size)))
    }

    #[cfg(test)]
    pub(crate) fn chain_len(&self) -> usize {
        self.chain_len
    }

    #[cfg(test)]
    pub(crate) fn submitted_in_loop(&self) -> usize {
        self.submitted_in_loop
    }

    #[cfg(test)]
    pub(crate) fn extra_entries(&self) -> u32 {
        self.extra_entries
    }

    #[cfg(test)]
    pub(crate) fn batch_size(&self) -> u32 {
        self.batch_size
    }
}
