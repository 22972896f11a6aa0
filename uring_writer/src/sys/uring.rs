// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use log::{debug, trace, warn};
use std::{fmt, mem, mem::ManuallyDrop, os::unix::io::RawFd, rc::Rc};

use crate::{
    error::{CompletionFault, Result, WriterError},
    free_list::{FreeList, Idx},
    iou::{Cqe, EnterFlags, Rings, Sqe},
    ordering::{LoopContext, WriteMode},
    sys::{
        write_buffer::{self, BufferAllocator, PendingWrite},
        RingSyscalls,
    },
    uring_sys::IoRingOp,
    Connection,
    RingStats,
};

// A linked write may still need its chain break and the loop barrier.
const LINKED_WRITE_RESERVE: u32 = 2;

type PendingMap = FreeList<PendingWrite>;
pub(crate) type PendingId = Idx<PendingWrite>;

// Zero is the no-op sentinel, so slots are stored one-based. The generation
// rides in the upper half.
fn to_user_data(id: PendingId) -> u64 {
    (u64::from(id.generation()) << 32) | (id.to_raw() as u64 + 1)
}

fn from_user_data(user_data: u64) -> Option<PendingId> {
    let slot = user_data & 0xffff_ffff;
    if slot == 0 {
        return None;
    }
    Some(PendingId::from_raw(
        (slot - 1) as usize,
        (user_data >> 32) as u32,
    ))
}

/// Owns the rings and every in-flight write.
pub(crate) struct UringEngine {
    rings: Rings,
    mode: WriteMode,
    ctx: LoopContext,
    // Not dropped while the kernel may still read the buffers it holds.
    pending: ManuallyDrop<PendingMap>,
    allocator: Rc<dyn BufferAllocator>,
    block_size: usize,
    stats: RingStats,
    faults: Vec<CompletionFault>,
    // Last value seen in the kernel's completion overflow counter.
    cq_overflow: u32,
}

impl UringEngine {
    pub(crate) fn new(
        depth: u32,
        mode: WriteMode,
        block_size: usize,
        allocator: Rc<dyn BufferAllocator>,
        syscalls: Rc<dyn RingSyscalls>,
    ) -> Result<UringEngine> {
        let rings = Rings::setup(depth, syscalls)?;
        let pending = FreeList::with_capacity(rings.sq().entries() as usize);
        let cq_overflow = rings.cq().overflow();
        let stats = RingStats {
            setup_calls: 1,
            ..RingStats::default()
        };
        Ok(UringEngine {
            rings,
            mode,
            ctx: LoopContext::default(),
            pending: ManuallyDrop::new(pending),
            allocator,
            block_size,
            stats,
            faults: Vec::new(),
            cq_overflow,
        })
    }

    fn ensure_space(&self, needed: u32) -> Result<()> {
        let available = self.rings.sq().space_left();
        if available < needed {
            Err(WriterError::RingFull { needed, available })
        } else {
            Ok(())
        }
    }

    /// Queues a copy of `data` for writing to `connection`. Returns the
    /// number of bytes accepted, which says nothing about completion.
    ///
    /// An error means nothing was queued. Once the entry is published the
    /// write succeeds even if the enter call fails or comes up short: the
    /// entry goes out with the next enter and the failure is only counted.
    pub(crate) fn write(&mut self, connection: Connection, data: &[u8]) -> Result<usize> {
        self.stats.write_calls += 1;
        if data.is_empty() {
            return Ok(0);
        }

        let reserve = if self.mode.links_writes() {
            LINKED_WRITE_RESERVE
        } else {
            0
        };
        self.ensure_space(1 + reserve)?;

        let (sqe, record) =
            write_buffer::prepare_write(&self.allocator, self.block_size, connection, data)?;
        let expected = record.expected() as usize;
        let flags = self.ctx.link_write(self.mode);
        let id = self.pending.alloc(record);
        let sqe = sqe.with_flags(flags).with_user_data(to_user_data(id));

        match self.submit(&sqe, true) {
            Ok(()) | Err(WriterError::Enter(_)) | Err(WriterError::SubmitMismatch { .. }) => {
                Ok(expected)
            }
            Err(err) => Err(err),
        }
    }

    /// Publishes `sqe` and, unless told otherwise, lets the mode decide
    /// whether the kernel hears about it now.
    fn submit(&mut self, sqe: &Sqe, allow_enter: bool) -> Result<()> {
        if self.rings.sq_mut().push(sqe).is_none() {
            return Err(WriterError::RingFull {
                needed: 1,
                available: 0,
            });
        }
        self.stats.entries_published += 1;

        if !allow_enter || self.mode.batching() {
            self.ctx.defer(self.mode, 1);
            return Ok(());
        }

        let to_submit = 1 + self.ctx.take_extra();
        if self.mode.blocking() {
            let res = self.enter_checked(to_submit, 1, EnterFlags::GETEVENTS);
            self.drain();
            res
        } else {
            self.enter_checked(to_submit, 0, EnterFlags::empty())
        }
    }

    /// Enters the ring and checks the kernel took exactly what was asked.
    /// Whatever it did not take goes back on the deferred count.
    fn enter_checked(&mut self, requested: u32, min_complete: u32, flags: EnterFlags) -> Result<()> {
        self.stats.enter_calls += 1;
        match self.rings.enter(requested, min_complete, flags) {
            Ok(submitted) => {
                self.stats.enter_requested += u64::from(submitted);
                if submitted != requested {
                    self.stats.enter_failures += 1;
                    warn!(
                        "io_uring_enter submitted {} entries, expected {}",
                        submitted, requested
                    );
                    self.ctx
                        .defer(self.mode, requested.saturating_sub(submitted));
                    return Err(WriterError::SubmitMismatch {
                        requested,
                        submitted,
                    });
                }
                Ok(())
            }
            Err(err) => {
                self.stats.enter_failures += 1;
                warn!(
                    "io_uring_enter for {} entries on fd {} failed: {}",
                    requested,
                    self.rings.fd(),
                    err
                );
                self.ctx.defer(self.mode, requested);
                Err(WriterError::Enter(err))
            }
        }
    }

    /// Cuts the chain of writes to `connection`. The no-op that does it is
    /// always deferred.
    ///
    /// The slot the loop barrier will need is never handed to a chain break.
    pub(crate) fn write_done(&mut self, connection: Connection) -> Result<()> {
        let nop = match self.ctx.chain_break(self.mode) {
            Some(nop) => nop,
            None => return Ok(()),
        };
        let barrier = self.ctx.loop_barrier(self.mode).is_some() as u32;
        self.ensure_space(1 + barrier)?;
        self.submit(&nop, false)?;
        let chain_len = self.ctx.chain_broken();
        trace!(
            "breaking chain of {} writes to fd {}",
            chain_len,
            connection.fd()
        );
        Ok(())
    }

    /// Reaps completions from the previous iteration.
    pub(crate) fn start_loop(&mut self) -> usize {
        self.drain()
    }

    /// Closes the iteration with a barrier and flushes the batch. The batch
    /// is flushed even if the barrier did not fit, so the caller can make
    /// room and retry.
    pub(crate) fn end_loop(&mut self) -> Result<()> {
        let barrier = self.insert_barrier();
        let flushed = self.flush_batch();
        barrier.and(flushed)
    }

    fn insert_barrier(&mut self) -> Result<()> {
        if let Some(barrier) = self.ctx.loop_barrier(self.mode) {
            self.ensure_space(1)?;
            self.submit(&barrier, false)?;
            self.ctx.barrier_inserted();
            trace!("inserted loop barrier (drain: {})", self.mode.pipelining());
        }
        Ok(())
    }

    fn flush_batch(&mut self) -> Result<()> {
        if !self.mode.batching() {
            return Ok(());
        }
        match self.ctx.take_batch() {
            Some((batch, size)) => {
                debug!("batch {}: submitting {} entries", batch, size);
                self.stats.batches_flushed += 1;
                self.enter_checked(size, 0, EnterFlags::empty())
            }
            None => Ok(()),
        }
    }

    /// Reaps every completion the kernel has posted. Returns how many.
    /// Calling it again with nothing new posted changes nothing.
    pub(crate) fn drain(&mut self) -> usize {
        let mut head = self.rings.cq().head();
        let mut reaped = 0;
        while head != self.rings.cq().tail() {
            let cqe = self.rings.cq().entry(head);
            self.complete(cqe);
            head = head.wrapping_add(1);
            reaped += 1;
        }
        if reaped > 0 {
            self.rings.cq_mut().publish_head(head);
        }

        let overflow = self.rings.cq().overflow();
        if overflow != self.cq_overflow {
            let lost = overflow.wrapping_sub(self.cq_overflow);
            warn!(
                "io_uring fd {} dropped {} completions; the buffers of their writes stay allocated",
                self.rings.fd(),
                lost
            );
            self.stats.completions_dropped += u64::from(lost);
            self.cq_overflow = overflow;
        }
        reaped
    }

    fn complete(&mut self, cqe: Cqe) {
        if cqe.is_nop() {
            self.stats.nops_completed += 1;
            return;
        }

        let record = from_user_data(cqe.user_data()).and_then(|id| self.pending.dealloc(id));
        let record = match record {
            Some(record) => record,
            None => {
                self.fault(CompletionFault::StaleToken {
                    user_data: cqe.user_data(),
                });
                return;
            }
        };

        match record.opcode() {
            IoRingOp::IORING_OP_WRITEV => {
                trace!(
                    "write of {} blocks to fd {} completed with {}",
                    record.blocks(),
                    record.connection().fd(),
                    cqe.raw_result()
                );
                self.stats.writes_completed += 1;
                if let Ok(bytes) = cqe.result() {
                    self.stats.bytes_completed += bytes as u64;
                }
                if cqe.raw_result() != record.expected() {
                    self.fault(CompletionFault::ResultMismatch {
                        connection: record.connection(),
                        expected: record.expected(),
                        result: cqe.raw_result(),
                    });
                }
            }
            op => self.fault(CompletionFault::UnhandledOp {
                connection: record.connection(),
                opcode: op as u8,
            }),
        }
        record.release();
    }

    fn fault(&mut self, fault: CompletionFault) {
        warn!("{}", fault);
        self.stats.faults += 1;
        self.faults.push(fault);
    }

    pub(crate) fn take_faults(&mut self) -> Vec<CompletionFault> {
        mem::take(&mut self.faults)
    }

    pub(crate) fn stats(&self) -> RingStats {
        self.stats
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn sq_pending(&self) -> u32 {
        self.rings.sq().pending()
    }

    pub(crate) fn cq_ready(&self) -> u32 {
        self.rings.cq().ready()
    }

    pub(crate) fn ring_fd(&self) -> RawFd {
        self.rings.fd()
    }

    pub(crate) fn mode(&self) -> WriteMode {
        self.mode
    }
}

impl fmt::Debug for UringEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UringEngine")
            .field("rings", &self.rings)
            .field("mode", &self.mode)
            .field("ctx", &self.ctx)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl Drop for UringEngine {
    fn drop(&mut self) {
        self.drain();
        if self.pending.is_empty() {
            unsafe { ManuallyDrop::drop(&mut self.pending) };
        } else {
            warn!(
                "leaking {} in-flight writes on io_uring fd {}",
                self.pending.len(),
                self.rings.fd()
            );
        }
    }
}
