// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::{
    iou::{EnterFlags, SubmissionFlags},
    sys::{
        write_buffer::{BufferAllocator, BufferKind},
        RingSyscalls,
    },
    uring_sys::{self, io_uring_cqe, io_uring_params, io_uring_sqe, IoRingOp},
};
use std::{
    alloc::Layout,
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt,
    io,
    mem,
    os::unix::io::RawFd,
    ptr::NonNull,
    sync::atomic::{AtomicU32, Ordering},
};
use tracing_subscriber::EnvFilter;

pub(crate) fn init_logging() {
    let _ = pretty_env_logger::try_init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("URING_WRITER_TRACE"))
        .try_init();
}

pub(crate) fn pipe() -> (RawFd, RawFd) {
    nix::unistd::pipe().unwrap()
}

pub(crate) fn read_exact(fd: RawFd, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut at = 0;
    while at < len {
        let n = nix::unistd::read(fd, &mut buf[at..]).unwrap();
        assert!(n > 0, "pipe closed after {} of {} bytes", at, len);
        at += n;
    }
    buf
}

pub(crate) fn close_pipe((rx, tx): (RawFd, RawFd)) {
    let _ = nix::unistd::close(rx);
    let _ = nix::unistd::close(tx);
}

// Ring layout handed out by the fake. Every field sits on its own cache line
// like the kernel's, and the index array follows the completion entries so
// a single region can hold everything.
const SQ_HEAD: u32 = 0;
const SQ_TAIL: u32 = 64;
const SQ_RING_MASK: u32 = 128;
const SQ_RING_ENTRIES: u32 = 132;
const SQ_FLAGS: u32 = 136;
const SQ_DROPPED: u32 = 140;
const CQ_HEAD: u32 = 256;
const CQ_TAIL: u32 = 320;
const CQ_RING_MASK: u32 = 384;
const CQ_RING_ENTRIES: u32 = 388;
const CQ_OVERFLOW: u32 = 392;
const CQ_CQES: u32 = 448;

const FAKE_RING_FD: RawFd = 4242;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EnterCall {
    pub(crate) to_submit: u32,
    pub(crate) min_complete: u32,
    pub(crate) flags: EnterFlags,
    pub(crate) submitted: u32,
}

/// A submission entry as the fake kernel consumed it, with the result it
/// posted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SqeRecord {
    pub(crate) opcode: u8,
    pub(crate) flags: SubmissionFlags,
    pub(crate) fd: RawFd,
    pub(crate) user_data: u64,
    pub(crate) iovecs: u32,
    pub(crate) result: i32,
}

struct Region {
    mem: Vec<u64>,
}

impl Region {
    fn new(len: usize) -> Region {
        Region {
            mem: vec![0u64; (len + 7) / 8],
        }
    }

    fn base(&mut self) -> *mut u8 {
        self.mem.as_mut_ptr() as *mut u8
    }
}

unsafe fn field<'a>(base: *mut u8, offset: u32) -> &'a AtomicU32 {
    &*(base.add(offset as usize) as *const AtomicU32)
}

#[derive(Default)]
struct FakeState {
    params: io_uring_params,
    regions: Vec<Region>,
    sq_ring: Option<*mut u8>,
    cq_ring: Option<*mut u8>,
    sqes: Option<*mut io_uring_sqe>,

    maps: Vec<u64>,
    unmaps: usize,
    closed: Vec<RawFd>,
    enters: Vec<EnterCall>,
    consumed: Vec<SqeRecord>,

    fail_setup: Option<i32>,
    fail_map: Option<u64>,
    fail_enter: Option<i32>,
    under_report: u32,
    next_results: VecDeque<i32>,
    hold: bool,
    held: Vec<io_uring_cqe>,
}

impl FakeState {
    fn execute(&mut self, sqe: &io_uring_sqe) -> (i32, bool) {
        match IoRingOp::from_raw(sqe.opcode) {
            Some(IoRingOp::IORING_OP_NOP) => (0, false),
            Some(IoRingOp::IORING_OP_WRITEV) => {
                let iovecs = sqe.addr as *const libc::iovec;
                let total: usize = (0..sqe.len as usize)
                    .map(|i| unsafe { (*iovecs.add(i)).iov_len })
                    .sum();
                let res = match self.next_results.pop_front() {
                    Some(res) => res,
                    None => {
                        let ret = unsafe { libc::writev(sqe.fd, iovecs, sqe.len as libc::c_int) };
                        if ret < 0 {
                            -io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
                        } else {
                            ret as i32
                        }
                    }
                };
                (res, res < 0 || res as usize != total)
            }
            _ => (-libc::EINVAL, true),
        }
    }

    fn complete(&mut self, cqe: io_uring_cqe) {
        if self.hold {
            self.held.push(cqe);
        } else {
            self.post(cqe);
        }
    }

    fn post(&mut self, cqe: io_uring_cqe) {
        let cq = match self.cq_ring {
            Some(cq) => cq,
            None => return,
        };
        let off = self.params.cq_off;
        let entries = self.params.cq_entries;
        unsafe {
            let head = field(cq, off.head).load(Ordering::Acquire);
            let ktail = field(cq, off.tail);
            let tail = ktail.load(Ordering::Relaxed);
            if tail.wrapping_sub(head) == entries {
                field(cq, off.overflow).fetch_add(1, Ordering::Relaxed);
                return;
            }
            let cqes = cq.add(off.cqes as usize) as *mut io_uring_cqe;
            cqes.add((tail & (entries - 1)) as usize).write(cqe);
            ktail.store(tail.wrapping_add(1), Ordering::Release);
        }
    }
}

/// An in-memory stand-in for the kernel side of a ring.
///
/// Entries are consumed synchronously inside `enter`: writes are really
/// performed with `writev`, link chains are cancelled after a failed or short
/// link, and every completion is posted before `enter` returns unless held.
pub(crate) struct FakeKernel {
    max_entries: u32,
    single_mmap: bool,
    state: RefCell<FakeState>,
}

impl fmt::Debug for FakeKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeKernel")
            .field("max_entries", &self.max_entries)
            .field("single_mmap", &self.single_mmap)
            .finish()
    }
}

impl FakeKernel {
    pub(crate) fn new(max_entries: u32, single_mmap: bool) -> FakeKernel {
        FakeKernel {
            max_entries,
            single_mmap,
            state: RefCell::new(FakeState::default()),
        }
    }

    pub(crate) fn mapped_offsets(&self) -> Vec<u64> {
        self.state.borrow().maps.clone()
    }

    pub(crate) fn unmapped_count(&self) -> usize {
        self.state.borrow().unmaps
    }

    pub(crate) fn closed(&self) -> Vec<RawFd> {
        self.state.borrow().closed.clone()
    }

    pub(crate) fn enter_calls(&self) -> Vec<EnterCall> {
        self.state.borrow().enters.clone()
    }

    pub(crate) fn consumed(&self) -> Vec<SqeRecord> {
        self.state.borrow().consumed.clone()
    }

    pub(crate) fn fail_setup(&self, errno: i32) {
        self.state.borrow_mut().fail_setup = Some(errno);
    }

    pub(crate) fn fail_map(&self, offset: u64) {
        self.state.borrow_mut().fail_map = Some(offset);
    }

    pub(crate) fn fail_enter(&self, errno: i32) {
        self.state.borrow_mut().fail_enter = Some(errno);
    }

    /// The next enter consumes, and reports, `count` fewer entries than
    /// asked for.
    pub(crate) fn under_report(&self, count: u32) {
        self.state.borrow_mut().under_report = count;
    }

    /// The next executed write completes with `res` instead of being
    /// performed.
    pub(crate) fn set_next_result(&self, res: i32) {
        self.state.borrow_mut().next_results.push_back(res);
    }

    pub(crate) fn hold_completions(&self, hold: bool) {
        self.state.borrow_mut().hold = hold;
    }

    pub(crate) fn release_held(&self) {
        let mut state = self.state.borrow_mut();
        for cqe in mem::take(&mut state.held) {
            state.post(cqe);
        }
    }

    /// Posts a completion nobody submitted.
    pub(crate) fn post_cqe(&self, user_data: u64, res: i32) {
        self.state.borrow_mut().post(io_uring_cqe {
            user_data,
            res,
            flags: 0,
        });
    }
}

impl RingSyscalls for FakeKernel {
    fn setup(&self, entries: u32, params: &mut io_uring_params) -> io::Result<RawFd> {
        let mut state = self.state.borrow_mut();
        if let Some(errno) = state.fail_setup.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        if entries == 0 || entries > self.max_entries {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let sq_entries = entries.next_power_of_two();
        let cq_entries = sq_entries * 2;

        params.sq_entries = sq_entries;
        params.cq_entries = cq_entries;
        params.features = if self.single_mmap {
            uring_sys::IORING_FEAT_SINGLE_MMAP
        } else {
            0
        };
        params.sq_off = uring_sys::io_sqring_offsets {
            head: SQ_HEAD,
            tail: SQ_TAIL,
            ring_mask: SQ_RING_MASK,
            ring_entries: SQ_RING_ENTRIES,
            flags: SQ_FLAGS,
            dropped: SQ_DROPPED,
            array: CQ_CQES + cq_entries * mem::size_of::<io_uring_cqe>() as u32,
            ..Default::default()
        };
        params.cq_off = uring_sys::io_cqring_offsets {
            head: CQ_HEAD,
            tail: CQ_TAIL,
            ring_mask: CQ_RING_MASK,
            ring_entries: CQ_RING_ENTRIES,
            overflow: CQ_OVERFLOW,
            cqes: CQ_CQES,
            ..Default::default()
        };
        state.params = *params;
        Ok(FAKE_RING_FD)
    }

    fn map(&self, _fd: RawFd, len: usize, offset: u64) -> io::Result<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        if state.fail_map == Some(offset) {
            state.fail_map = None;
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        state.maps.push(offset);

        let mut region = Region::new(len);
        let base = region.base();
        let params = state.params;
        let init_sq = |base: *mut u8| unsafe {
            field(base, SQ_RING_MASK).store(params.sq_entries - 1, Ordering::Relaxed);
            field(base, SQ_RING_ENTRIES).store(params.sq_entries, Ordering::Relaxed);
        };
        let init_cq = |base: *mut u8| unsafe {
            field(base, CQ_RING_MASK).store(params.cq_entries - 1, Ordering::Relaxed);
            field(base, CQ_RING_ENTRIES).store(params.cq_entries, Ordering::Relaxed);
        };
        match offset {
            uring_sys::IORING_OFF_SQ_RING => {
                init_sq(base);
                state.sq_ring = Some(base);
                if self.single_mmap {
                    init_cq(base);
                    state.cq_ring = Some(base);
                }
            }
            uring_sys::IORING_OFF_CQ_RING => {
                init_cq(base);
                state.cq_ring = Some(base);
            }
            uring_sys::IORING_OFF_SQES => state.sqes = Some(base as *mut io_uring_sqe),
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        state.regions.push(region);
        NonNull::new(base).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))
    }

    unsafe fn unmap(&self, _ptr: NonNull<u8>, _len: usize) {
        self.state.borrow_mut().unmaps += 1;
    }

    fn enter(
        &self,
        _fd: RawFd,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
    ) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        let mut call = EnterCall {
            to_submit,
            min_complete,
            flags,
            submitted: 0,
        };
        if let Some(errno) = state.fail_enter.take() {
            state.enters.push(call);
            return Err(io::Error::from_raw_os_error(errno));
        }
        let (sq, sqes) = match (state.sq_ring, state.sqes) {
            (Some(sq), Some(sqes)) => (sq, sqes),
            _ => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        let off = state.params.sq_off;
        let mask = state.params.sq_entries - 1;

        let (khead, head, tail) = unsafe {
            let khead = field(sq, off.head);
            (khead, khead.load(Ordering::Relaxed), field(sq, off.tail).load(Ordering::Acquire))
        };
        let under_report = mem::take(&mut state.under_report);
        let take = to_submit
            .min(tail.wrapping_sub(head))
            .saturating_sub(under_report);

        let array = unsafe { sq.add(off.array as usize) as *const u32 };
        let mut cancelling = false;
        for i in 0..take {
            let sqe = unsafe {
                let index = array
                    .add((head.wrapping_add(i) & mask) as usize)
                    .read_volatile();
                sqes.add(index as usize).read()
            };
            let flags = SubmissionFlags::from_bits_truncate(sqe.flags);
            let (result, failed) = if cancelling {
                (-libc::ECANCELED, true)
            } else {
                state.execute(&sqe)
            };
            cancelling = failed && flags.contains(SubmissionFlags::IO_LINK);

            state.consumed.push(SqeRecord {
                opcode: sqe.opcode,
                flags,
                fd: sqe.fd,
                user_data: sqe.user_data,
                iovecs: sqe.len,
                result,
            });
            state.complete(io_uring_cqe {
                user_data: sqe.user_data,
                res: result,
                flags: 0,
            });
        }
        khead.store(head.wrapping_add(take), Ordering::Release);

        call.submitted = take;
        state.enters.push(call);
        Ok(take)
    }

    fn close(&self, fd: RawFd) {
        self.state.borrow_mut().closed.push(fd);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocEvent {
    Allocate {
        kind: BufferKind,
        addr: usize,
        size: usize,
    },
    Release {
        kind: BufferKind,
        addr: usize,
    },
}

#[derive(Debug, Default)]
struct TrackingState {
    events: Vec<AllocEvent>,
    live: HashMap<usize, (BufferKind, Layout)>,
    fail_after: Option<usize>,
}

/// Logs every allocation and release, and panics on a double free or on
/// the release of memory it never handed out.
#[derive(Debug, Default)]
pub(crate) struct TrackingAllocator {
    state: RefCell<TrackingState>,
}

impl TrackingAllocator {
    pub(crate) fn events(&self) -> Vec<AllocEvent> {
        self.state.borrow().events.clone()
    }

    pub(crate) fn live(&self) -> usize {
        self.state.borrow().live.len()
    }

    /// Lets `successes` more allocations through, then fails one.
    pub(crate) fn fail_after(&self, successes: usize) {
        self.state.borrow_mut().fail_after = Some(successes);
    }
}

impl BufferAllocator for TrackingAllocator {
    fn allocate(&self, kind: BufferKind, layout: Layout) -> Option<NonNull<u8>> {
        let mut state = self.state.borrow_mut();
        match state.fail_after {
            Some(0) => {
                state.fail_after = None;
                return None;
            }
            Some(n) => state.fail_after = Some(n - 1),
            None => {}
        }
        let ptr = NonNull::new(unsafe { std::alloc::alloc(layout) })?;
        let addr = ptr.as_ptr() as usize;
        state.live.insert(addr, (kind, layout));
        state.events.push(AllocEvent::Allocate {
            kind,
            addr,
            size: layout.size(),
        });
        Some(ptr)
    }

    unsafe fn release(&self, kind: BufferKind, ptr: NonNull<u8>, layout: Layout) {
        let mut state = self.state.borrow_mut();
        let addr = ptr.as_ptr() as usize;
        match state.live.remove(&addr) {
            Some((allocated_kind, allocated_layout)) => {
                assert_eq!(allocated_kind, kind, "buffer released as the wrong kind");
                assert_eq!(allocated_layout, layout, "buffer released with the wrong layout");
            }
            None => panic!("double free or foreign release of {:#x}", addr),
        }
        state.events.push(AllocEvent::Release { kind, addr });
        drop(state);
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

#[test]
#[allow(unused_must_use)]
fn test_tracing_init() {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::from_env("URING_WRITER_TRACE"))
        .try_init();

    tracing::info!("Started tracing..");
    log::debug!("Started logging..");
}

#[test]
#[should_panic(expected = "double free")]
fn tracking_allocator_catches_double_free() {
    let tracker = TrackingAllocator::default();
    let layout = Layout::from_size_align(64, 8).unwrap();
    let ptr = tracker.allocate(BufferKind::Data, layout).unwrap();
    unsafe {
        tracker.release(BufferKind::Data, ptr, layout);
        tracker.release(BufferKind::Data, ptr, layout);
    }
}
