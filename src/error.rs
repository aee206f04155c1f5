//! Error kinds surfaced by the VM core.

use core::fmt;

/// Everything that can fail inside the VM core.
///
/// `AlreadyMapped` is recoverable and reported to the caller (mmap,
/// page allocation). The rest propagate to the trap dispatcher, which
/// terminates the faulting process with exit status -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Null pointer or kernel-space address reached from user code.
    BadAddress,
    /// Write attempted on a page mapped read-only.
    Protection,
    /// Fault outside the SPT and outside the stack-growth region.
    NoPage,
    /// An allocation failed. User-pool exhaustion with nothing
    /// evictable does not produce this; it panics instead.
    OutOfMemory,
    /// A file or swap transfer failed or came up short.
    Io,
    /// The SPT already holds a page at this address.
    AlreadyMapped,
}

pub type Result<T> = core::result::Result<T, VmError>;

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::BadAddress => write!(f, "bad address"),
            VmError::Protection => write!(f, "protection violation"),
            VmError::NoPage => write!(f, "no page"),
            VmError::OutOfMemory => write!(f, "out of memory"),
            VmError::Io => write!(f, "i/o error"),
            VmError::AlreadyMapped => write!(f, "already mapped"),
        }
    }
}

/// Runs `$code` and returns either the unwrapped result or executes `$or`.
#[macro_export]
macro_rules! ok_or {
    ($code:expr, $err:ident, $or:expr) => {
        match $code {
            Ok(result) => result,
            Err($err) => $or,
        }
    };
    ($code:expr, $or:expr) => {
        match $code {
            Ok(result) => result,
            Err(_) => $or,
        }
    };
}

/// Runs an expression and returns either the unwrapped result or executes `$or`.
#[macro_export]
macro_rules! some_or {
    ($code:expr, $or:expr) => {
        match $code {
            Some(result) => result,
            None => $or,
        }
    };
}
