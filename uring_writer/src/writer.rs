// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use log::{debug, error};
use std::{fmt, os::unix::io::RawFd, rc::Rc};

use crate::{
    error::{CompletionFault, Result, WriterError},
    ordering::WriteMode,
    sys::{
        write_buffer::{BufferAllocator, SystemAllocator},
        Kernel,
        RingSyscalls,
        UringEngine,
    },
    Connection,
    RingStats,
};

/// Submission slots requested from the kernel unless told otherwise.
pub const DEFAULT_RING_DEPTH: u32 = 16384;

/// Size of the blocks outbound data is split into unless told otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// A factory to configure and create a [`UringWriter`].
///
/// Methods can be chained on the builder in order to configure it. The
/// [`build`] method returns a writer that has not touched the kernel yet;
/// [`init`] builds and initializes in one go.
///
/// # Examples
///
/// ```no_run
/// use uring_writer::WriterBuilder;
///
/// let writer = WriterBuilder::new()
///     .ring_depth(256)
///     .batching(true)
///     .pipelining(true)
///     .init()
///     .unwrap();
/// assert!(writer.is_initialized());
/// ```
///
/// [`build`]: WriterBuilder::build
/// [`init`]: WriterBuilder::init
pub struct WriterBuilder {
    /// Submission slots to ask the kernel for. The kernel may round it up.
    ring_depth: u32,
    /// Outbound data is copied into blocks of this size, one iovec each.
    block_size: usize,
    mode: WriteMode,
    allocator: Rc<dyn BufferAllocator>,
    syscalls: Rc<dyn RingSyscalls>,
}

impl fmt::Debug for WriterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterBuilder")
            .field("ring_depth", &self.ring_depth)
            .field("block_size", &self.block_size)
            .field("mode", &self.mode)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl Default for WriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterBuilder {
    /// Generates the default configuration: a 16384 slot ring, 1 KiB
    /// blocks, every mode switch off and the global allocator.
    pub fn new() -> WriterBuilder {
        WriterBuilder {
            ring_depth: DEFAULT_RING_DEPTH,
            block_size: DEFAULT_BLOCK_SIZE,
            mode: WriteMode::default(),
            allocator: Rc::new(SystemAllocator),
            syscalls: Rc::new(Kernel),
        }
    }

    /// The depth of the ring to create. This bounds how many entries can be
    /// waiting for the kernel at once.
    #[must_use = "The builder must be built to be useful"]
    pub fn ring_depth(mut self, ring_depth: u32) -> WriterBuilder {
        assert!(ring_depth > 0, "ring depth must be positive");
        self.ring_depth = ring_depth;
        self
    }

    /// Size of the blocks outbound data is split into. Must be a power of
    /// two.
    #[must_use = "The builder must be built to be useful"]
    pub fn block_size(mut self, block_size: usize) -> WriterBuilder {
        assert!(
            block_size.is_power_of_two(),
            "block size must be a non-zero power of two"
        );
        self.block_size = block_size;
        self
    }

    /// Defer every enter to the end of the loop iteration.
    #[must_use = "The builder must be built to be useful"]
    pub fn batching(mut self, batching: bool) -> WriterBuilder {
        self.mode = WriteMode::new(batching, self.mode.blocking(), self.mode.pipelining());
        self
    }

    /// Wait for each write to complete before returning from
    /// [`UringWriter::submit_write`]. Has no effect while batching.
    #[must_use = "The builder must be built to be useful"]
    pub fn blocking(mut self, blocking: bool) -> WriterBuilder {
        self.mode = WriteMode::new(self.mode.batching(), blocking, self.mode.pipelining());
        self
    }

    /// Make each iteration's barrier drain the ring, so no write of the next
    /// iteration starts before every write of this one completed.
    #[must_use = "The builder must be built to be useful"]
    pub fn pipelining(mut self, pipelining: bool) -> WriterBuilder {
        self.mode = WriteMode::new(self.mode.batching(), self.mode.blocking(), pipelining);
        self
    }

    /// Where the memory for pending writes comes from.
    #[must_use = "The builder must be built to be useful"]
    pub fn buffer_allocator(mut self, allocator: Rc<dyn BufferAllocator>) -> WriterBuilder {
        self.allocator = allocator;
        self
    }

    #[cfg(test)]
    pub(crate) fn syscalls(mut self, syscalls: Rc<dyn RingSyscalls>) -> WriterBuilder {
        self.syscalls = syscalls;
        self
    }

    /// Returns a writer with this configuration. No ring exists until
    /// [`UringWriter::init`] is called.
    pub fn build(self) -> UringWriter {
        UringWriter {
            config: self,
            engine: None,
        }
    }

    /// Builds the writer and sets up its ring.
    pub fn init(self) -> Result<UringWriter> {
        let mut writer = self.build();
        writer.init()?;
        Ok(writer)
    }
}

/// The write side of an event loop, backed by a single `io_uring`.
///
/// The loop drives it through four calls per iteration:
/// [`start_of_loop`] to reap what completed since last time, any number of
/// [`submit_write`]s, a [`write_done`] for each connection that was written
/// to, and finally [`end_of_loop`].
///
/// Writes to the same connection are executed in the order they were
/// submitted. A write's outcome is only known once its completion is reaped;
/// problems found then are collected by [`take_faults`].
///
/// [`start_of_loop`]: UringWriter::start_of_loop
/// [`submit_write`]: UringWriter::submit_write
/// [`write_done`]: UringWriter::write_done
/// [`end_of_loop`]: UringWriter::end_of_loop
/// [`take_faults`]: UringWriter::take_faults
#[derive(Debug)]
pub struct UringWriter {
    config: WriterBuilder,
    engine: Option<UringEngine>,
}

impl Default for UringWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl UringWriter {
    /// An uninitialized writer with the default configuration.
    pub fn new() -> UringWriter {
        WriterBuilder::new().build()
    }

    /// Shortcut for [`WriterBuilder::new`].
    pub fn builder() -> WriterBuilder {
        WriterBuilder::new()
    }

    /// Creates and maps the ring. Can only succeed once per writer; if it
    /// fails nothing is kept and it may be retried.
    pub fn init(&mut self) -> Result<()> {
        if self.engine.is_some() {
            error!("io_uring writer initialized twice");
            return Err(WriterError::AlreadyInitialized);
        }
        let config = &self.config;
        let engine = UringEngine::new(
            config.ring_depth,
            config.mode,
            config.block_size,
            config.allocator.clone(),
            config.syscalls.clone(),
        )?;
        debug!(
            "io_uring writer initialized on fd {}: depth {}, block size {}, {:?}",
            engine.ring_fd(),
            config.ring_depth,
            config.block_size,
            config.mode
        );
        self.engine = Some(engine);
        Ok(())
    }

    /// Sets the three mode switches and initializes.
    pub fn init_with_modes(&mut self, batch: bool, block: bool, pipeline: bool) -> Result<()> {
        if self.engine.is_some() {
            error!("io_uring writer initialized twice");
            return Err(WriterError::AlreadyInitialized);
        }
        self.config.mode = WriteMode::new(batch, block, pipeline);
        self.init()
    }

    /// Whether [`init`](UringWriter::init) succeeded.
    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    fn engine_mut(&mut self, op: &'static str) -> Result<&mut UringEngine> {
        match self.engine.as_mut() {
            Some(engine) => Ok(engine),
            None => {
                error!("{} called before the io_uring writer was initialized", op);
                Err(WriterError::NotInitialized { op })
            }
        }
    }

    /// Queues `data` for writing to `connection`.
    ///
    /// The bytes are copied, so `data` may be reused as soon as this returns.
    /// The returned length is what was accepted for writing; how much the
    /// kernel actually wrote is only known when the completion is reaped.
    ///
    /// An error means nothing was queued and the write may be retried:
    /// [`WriterError::RingFull`] when the ring has no room (end the
    /// iteration first), [`WriterError::Allocation`] or
    /// [`WriterError::WriteTooLarge`]. Once queued the write is never
    /// reported as failed here, even if handing it to the kernel failed;
    /// it then goes out with the next enter, and the failure shows up in
    /// [`RingStats::enter_failures`].
    pub fn submit_write(&mut self, connection: Connection, data: &[u8]) -> Result<usize> {
        self.engine_mut("submit_write")?.write(connection, data)
    }

    /// Marks the end of this iteration's writes to `connection`.
    pub fn write_done(&mut self, connection: Connection) -> Result<()> {
        self.engine_mut("write_done")?.write_done(connection)
    }

    /// Reaps every completion posted so far and releases the buffers of the
    /// writes they belong to. Returns how many completions were reaped.
    ///
    /// This is the only place completions are reaped outside of blocking
    /// mode, so it must be called on every iteration.
    pub fn start_of_loop(&mut self) -> Result<usize> {
        Ok(self.engine_mut("start_of_loop")?.start_loop())
    }

    /// Closes the iteration: orders it before the next one and hands any
    /// batched entries to the kernel.
    ///
    /// On [`WriterError::Enter`] or [`WriterError::SubmitMismatch`] the
    /// entries stay queued for the next flush; calling this again does not
    /// duplicate them.
    pub fn end_of_loop(&mut self) -> Result<()> {
        self.engine_mut("end_of_loop")?.end_loop()
    }

    /// Problems found in completions since the last call.
    pub fn take_faults(&mut self) -> Vec<CompletionFault> {
        self.engine
            .as_mut()
            .map(UringEngine::take_faults)
            .unwrap_or_default()
    }

    /// Counters since initialization. All zero before.
    pub fn stats(&self) -> RingStats {
        self.engine
            .as_ref()
            .map(UringEngine::stats)
            .unwrap_or_default()
    }

    /// Writes submitted whose completion was not reaped yet.
    pub fn in_flight(&self) -> usize {
        self.engine.as_ref().map_or(0, UringEngine::in_flight)
    }

    /// Entries published to the submission ring the kernel has not consumed.
    pub fn sq_pending(&self) -> u32 {
        self.engine.as_ref().map_or(0, UringEngine::sq_pending)
    }

    /// Completions posted by the kernel and not reaped yet.
    pub fn cq_ready(&self) -> u32 {
        self.engine.as_ref().map_or(0, UringEngine::cq_ready)
    }

    /// The ring's file descriptor, once initialized.
    pub fn ring_fd(&self) -> Option<RawFd> {
        self.engine.as_ref().map(UringEngine::ring_fd)
    }

    /// The mode this writer runs, or will run, in.
    pub fn mode(&self) -> WriteMode {
        self.engine
            .as_ref()
            .map_or(self.config.mode, UringEngine::mode)
    }
}
