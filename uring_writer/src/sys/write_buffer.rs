// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
// Owned copies of outbound data. The kernel reads these asynchronously, so
// they are kept alive by the engine until the matching completion arrives.

use std::{alloc::Layout, fmt, ptr, ptr::NonNull, rc::Rc};

use smallvec::SmallVec;

use crate::{
    error::{Result, WriterError},
    iou::Sqe,
    uring_sys::{IoRingOp, UIO_MAXIOV},
    Connection,
};

/// What a buffer handed to a [`BufferAllocator`] is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Block-aligned copy of the caller's bytes.
    Data,
    /// The container of a pending write's bookkeeping: the scatter/gather
    /// list the kernel reads. Always released after the data it describes.
    Record,
}

/// Supplies the memory behind pending writes.
///
/// Every buffer is released exactly once, with the same kind and layout it
/// was allocated with. For a single write the [`BufferKind::Data`] buffer
/// is always released before its [`BufferKind::Record`].
pub trait BufferAllocator: fmt::Debug {
    /// Returns `None` if the memory cannot be provided.
    fn allocate(&self, kind: BufferKind, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this allocator with the
    /// same `kind` and `layout`, and must not be used afterwards.
    unsafe fn release(&self, kind: BufferKind, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BufferAllocator for SystemAllocator {
    fn allocate(&self, _kind: BufferKind, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }

    unsafe fn release(&self, _kind: BufferKind, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

pub(crate) struct IoBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    kind: BufferKind,
    allocator: Rc<dyn BufferAllocator>,
}

impl IoBuffer {
    fn new(allocator: &Rc<dyn BufferAllocator>, kind: BufferKind, layout: Layout) -> Result<IoBuffer> {
        let ptr = allocator
            .allocate(kind, layout)
            .ok_or(WriterError::Allocation {
                size: layout.size(),
            })?;
        Ok(IoBuffer {
            ptr,
            layout,
            kind,
            allocator: allocator.clone(),
        })
    }

    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        unsafe { self.allocator.release(self.kind, self.ptr, self.layout) }
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("kind", &self.kind)
            .field("ptr", &self.ptr)
            .field("size", &self.layout.size())
            .finish()
    }
}

/// Everything an in-flight write owns. Lives in the engine's arena from
/// submission until its completion is reaped.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    opcode: IoRingOp,
    connection: Connection,
    expected: i32,
    blocks: u32,
    // Release order: data first, then the record container.
    releases: SmallVec<[IoBuffer; 2]>,
}

impl PendingWrite {
    pub(crate) fn opcode(&self) -> IoRingOp {
        self.opcode
    }

    pub(crate) fn connection(&self) -> Connection {
        self.connection
    }

    pub(crate) fn expected(&self) -> i32 {
        self.expected
    }

    pub(crate) fn blocks(&self) -> u32 {
        self.blocks
    }

    #[cfg(test)]
    pub(crate) fn with_opcode(mut self, opcode: IoRingOp) -> PendingWrite {
        self.opcode = opcode;
        self
    }

    /// Frees every owned buffer in list order.
    pub(crate) fn release(mut self) {
        for buffer in self.releases.drain(..) {
            drop(buffer);
        }
    }
}

/// Largest write a single submission can carry with `block_size` blocks.
pub(crate) fn max_write_len(block_size: usize) -> usize {
    UIO_MAXIOV
        .saturating_mul(block_size)
        .min(i32::MAX as usize)
}

/// Copies `data` into a block-aligned buffer, builds the iovec list over the
/// copy and returns the vectored write that sends it along with the record
/// that keeps all of it alive.
///
/// `data` must not be empty. Nothing is allocated if the write is rejected.
pub(crate) fn prepare_write(
    allocator: &Rc<dyn BufferAllocator>,
    block_size: usize,
    connection: Connection,
    data: &[u8],
) -> Result<(Sqe, PendingWrite)> {
    debug_assert!(!data.is_empty());
    debug_assert!(block_size.is_power_of_two());

    let len = data.len();
    let max = max_write_len(block_size);
    if len > max {
        return Err(WriterError::WriteTooLarge { len, max });
    }
    let blocks = (len + block_size - 1) / block_size;

    let data_layout = Layout::from_size_align(blocks * block_size, block_size)
        .map_err(|_| WriterError::Allocation { size: len })?;
    let record_layout = Layout::array::<libc::iovec>(blocks).map_err(|_| WriterError::Allocation {
        size: blocks * std::mem::size_of::<libc::iovec>(),
    })?;

    let data_buffer = IoBuffer::new(allocator, BufferKind::Data, data_layout)?;
    let record = IoBuffer::new(allocator, BufferKind::Record, record_layout)?;

    let base = data_buffer.as_mut_ptr();
    let iovecs = record.as_mut_ptr() as *mut libc::iovec;
    unsafe {
        ptr::copy_nonoverlapping(data.as_ptr(), base, len);
        for (i, chunk) in data.chunks(block_size).enumerate() {
            iovecs.add(i).write(libc::iovec {
                iov_base: base.add(i * block_size) as *mut libc::c_void,
                iov_len: chunk.len(),
            });
        }
    }

    let sqe = Sqe::writev(connection.fd(), iovecs, blocks as u32);
    let mut releases = SmallVec::new();
    releases.push(data_buffer);
    releases.push(record);

    Ok((
        sqe,
        PendingWrite {
            opcode: IoRingOp::IORING_OP_WRITEV,
            connection,
            expected: len as i32,
            blocks: blocks as u32,
            releases,
        },
    ))
}
