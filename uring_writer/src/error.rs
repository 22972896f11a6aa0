// Unless explicitly stated otherwise all files in this repository are licensed under the
// MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use crate::Connection;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result type alias that all public entry points of this crate use.
pub type Result<T> = std::result::Result<T, WriterError>;

/// The shared-memory region a mapping failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRegion {
    /// The submission queue control structure and index array.
    SubmissionRing,
    /// The completion queue control structure and entry array.
    CompletionRing,
    /// The submission queue entry array.
    SubmissionEntries,
}

impl fmt::Display for RingRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingRegion::SubmissionRing => f.write_str("submission ring"),
            RingRegion::CompletionRing => f.write_str("completion ring"),
            RingRegion::SubmissionEntries => f.write_str("submission entries"),
        }
    }
}

#[derive(Error, Debug)]
/// Errors returned by the lifecycle entry points of a
/// [`UringWriter`](crate::UringWriter).
pub enum WriterError {
    /// The kernel refused to create the ring.
    #[error("io_uring setup failed: {0}")]
    Setup(#[source] io::Error),

    /// Mapping one of the ring regions failed.
    #[error("mapping the {region} failed: {source}")]
    Map {
        /// Which region could not be mapped
        region: RingRegion,
        /// The underlying mmap error
        #[source]
        source: io::Error,
    },

    /// An entry point was called before the writer was initialized.
    #[error("{op} called before the io_uring writer was initialized")]
    NotInitialized {
        /// The entry point that was called
        op: &'static str,
    },

    /// `init` was called on a writer that already owns a ring.
    #[error("the io_uring writer is already initialized")]
    AlreadyInitialized,

    /// The enter system call failed outright.
    #[error("io_uring_enter failed: {0}")]
    Enter(#[source] io::Error),

    /// The kernel accepted a different number of entries than requested.
    /// Entries it did not consume stay published in the ring.
    #[error("io_uring_enter submitted {submitted} entries, expected {requested}")]
    SubmitMismatch {
        /// Entries the call asked the kernel to consume
        requested: u32,
        /// Entries the kernel reported as consumed
        submitted: u32,
    },

    /// Not enough free submission slots. Nothing was published.
    #[error("submission ring full: {needed} slots needed, {available} available")]
    RingFull {
        /// Slots the operation needs
        needed: u32,
        /// Slots currently free
        available: u32,
    },

    /// A buffer for a pending write could not be allocated.
    #[error("failed to allocate {size} bytes for a pending write")]
    Allocation {
        /// Requested allocation size
        size: usize,
    },

    /// The write cannot be expressed as a single vectored write.
    #[error("write of {len} bytes exceeds the {max} byte limit of a single submission")]
    WriteTooLarge {
        /// Length of the rejected write
        len: usize,
        /// Largest accepted length
        max: usize,
    },
}

/// A problem found while harvesting completions. These never fail the call
/// that harvested them; they are queued for
/// [`UringWriter::take_faults`](crate::UringWriter::take_faults).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionFault {
    /// A write completed with a result other than its full length. The
    /// write may have been short, failed, or cancelled by a broken chain.
    #[error("write to fd {} completed with {result}, expected {expected}", .connection.fd())]
    ResultMismatch {
        /// The connection the write was destined for
        connection: Connection,
        /// Bytes the write should have transferred
        expected: i32,
        /// Raw completion result (negative errno on failure)
        result: i32,
    },

    /// A completion referenced an operation kind the reader does not handle.
    /// Its buffers were still released.
    #[error("unhandled completion for opcode {opcode} on fd {}", .connection.fd())]
    UnhandledOp {
        /// The connection the operation belonged to
        connection: Connection,
        /// Raw opcode recorded at submission
        opcode: u8,
    },

    /// A completion carried a correlation token with no live record.
    #[error("completion with unknown correlation token {user_data:#x}")]
    StaleToken {
        /// The token echoed back by the kernel
        user_data: u64,
    },
}

impl CompletionFault {
    /// The connection affected by this fault, if it can be attributed.
    pub fn connection(&self) -> Option<Connection> {
        match self {
            CompletionFault::ResultMismatch { connection, .. }
            | CompletionFault::UnhandledOp { connection, .. } => Some(*connection),
            CompletionFault::StaleToken { .. } => None,
        }
    }

    /// The completion result as an `io::Result`, for mismatches.
    pub fn result(&self) -> Option<io::Result<usize>> {
        match self {
            CompletionFault::ResultMismatch { result, .. } if *result < 0 => {
                Some(Err(io::Error::from_raw_os_error(-result)))
            }
            CompletionFault::ResultMismatch { result, .. } => Some(Ok(*result as usize)),
            _ => None,
        }
    }
}

/// Augments an `io::Error` with more information about what was happening
/// and on which ring when the error ocurred.
pub(crate) struct ErrorEnhancer {
    pub(crate) inner: io::Error,
    pub(crate) op: &'static str,
    pub(crate) fd: Option<RawFd>,
}

impl fmt::Debug for ErrorEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for ErrorEnhancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, op: {}", self.inner, self.op)?;
        if let Some(fd) = self.fd {
            write!(f, " with ring fd {}", fd)?;
        }
        Ok(())
    }
}

impl From<ErrorEnhancer> for io::Error {
    fn from(err: ErrorEnhancer) -> io::Error {
        io::Error::new(err.inner.kind(), format!("{}", err))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enhance_error() {
        let inner = io::Error::from_raw_os_error(9);
        let enhanced = ErrorEnhancer {
            inner,
            op: "mmap",
            fd: Some(32),
        };
        let s = format!("{}", enhanced);
        assert_eq!(s, "Bad file descriptor (os error 9), op: mmap with ring fd 32");
    }

    fn convert_error() -> io::Result<()> {
        let inner = io::Error::from_raw_os_error(12);
        let enhanced = ErrorEnhancer {
            inner,
            op: "io_uring_setup",
            fd: None,
        };
        Err(enhanced)?;
        Ok(())
    }

    #[test]
    fn enhance_error_converted() {
        let io_error = convert_error().unwrap_err();
        assert_eq!(io_error.kind(), io::ErrorKind::OutOfMemory);
        let s = format!("{}", io_error.into_inner().unwrap());
        assert_eq!(
            s,
            "Cannot allocate memory (os error 12), op: io_uring_setup"
        );
    }

    #[test]
    fn map_error_names_region() {
        let err = WriterError::Map {
            region: RingRegion::CompletionRing,
            source: io::Error::from_raw_os_error(22),
        };
        assert!(err.to_string().starts_with("mapping the completion ring failed"));
    }

    #[test]
    fn fault_results() {
        let connection = Connection::new(7, 0);
        let failed = CompletionFault::ResultMismatch {
            connection,
            expected: 10,
            result: -libc::ECANCELED,
        };
        assert_eq!(failed.connection(), Some(connection));
        assert_eq!(
            failed.result().unwrap().unwrap_err().raw_os_error(),
            Some(libc::ECANCELED)
        );

        let short = CompletionFault::ResultMismatch {
            connection,
            expected: 10,
            result: 4,
        };
        assert_eq!(short.result().unwrap().unwrap(), 4);
        assert_eq!(
            short.to_string(),
            "write to fd 7 completed with 4, expected 10"
        );

        let stale = CompletionFault::StaleToken { user_data: 0x10 };
        assert!(stale.connection().is_none());
        assert!(stale.result().is_none());
    }
}
