use std::io;

use crate::uring_sys;

/// A completed IO event, copied out of the completion ring.
///
/// Completion does not imply success: check [`Cqe::result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cqe {
    user_data: u64,
    res: i32,
    flags: u32,
}

impl Cqe {
    pub fn from_raw(cqe: uring_sys::io_uring_cqe) -> Cqe {
        Cqe {
            user_data: cqe.user_data,
            res: cqe.res,
            flags: cqe.flags,
        }
    }

    pub fn user_data(&self) -> u64 {
        self.user_data
    }

    /// Whether this event belongs to an operation that owns no record.
    pub fn is_nop(&self) -> bool {
        self.user_data == uring_sys::NOP_USER_DATA
    }

    /// Bytes transferred, or a negated errno.
    pub fn raw_result(&self) -> i32 {
        self.res
    }

    pub fn result(&self) -> io::Result<usize> {
        if self.res >= 0 {
            Ok(self.res as usize)
        } else {
            Err(io::Error::from_raw_os_error(-self.res))
        }
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results() {
        let ok = Cqe::from_raw(uring_sys::io_uring_cqe {
            user_data: 5,
            res: 2048,
            flags: 0,
        });
        assert!(!ok.is_nop());
        assert_eq!(ok.result().unwrap(), 2048);

        let cancelled = Cqe::from_raw(uring_sys::io_uring_cqe {
            user_data: 0,
            res: -libc::ECANCELED,
            flags: 0,
        });
        assert!(cancelled.is_nop());
        assert_eq!(
            cancelled.result().unwrap_err().raw_os_error(),
            Some(libc::ECANCELED)
        );
    }
}
