//! Crate-wide error type.
//!
//! Mirrors the shape of a typical storage-stack error: a small, closed
//! `Errno` enum plus an optional static diagnostic message, rather than a
//! generic boxed `dyn Error`. Every fallible operation in this crate
//! returns `Result<T> = Result<T, Error>`.

use std::fmt;

/// The error types used across the metadata server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// A B-tree leaf or node had no room left for the requested insert.
    Full,
    /// The requested item (snapshot, chunk, lock, ...) does not exist.
    NotFound,
    /// Caller-supplied arguments failed validation.
    InvalidArgs,
    /// An allocation space has no free chunks left, even after reclamation.
    OutOfSpace,
    /// A read or write against a block device failed.
    IoFailed,
    /// On-disk data failed a structural check (bad magic, bad checksum, ...).
    CorruptState,
    /// Journal recovery could not establish a unique newest transaction.
    RecoveryFailed,
    /// A wire message was malformed or exceeded size limits.
    ProtocolError,
    /// A snapshot tag collided with an existing live snapshot.
    DuplicateTag,
    /// The 64-snapshot limit has been reached.
    TooManySnapshots,
}

/// An error with an [`Errno`] classification and an optional static message.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    /// Creates a new error with the given error type and no message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    /// Creates a new error with the given error type and a static message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    /// Returns the error classification.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Returns the diagnostic message, if any.
    pub fn msg(&self) -> &str {
        self.msg.unwrap_or("")
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        log::error!("device I/O failed: {e}");
        Error::new(Errno::IoFailed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

/// Shorthand result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns early with a bare [`Errno`].
#[macro_export]
macro_rules! return_errno {
    ($errno:expr) => {
        return core::result::Result::Err($crate::error::Error::new($errno))
    };
}

/// Returns early with an [`Errno`] and a static diagnostic message.
#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno:expr, $msg:expr) => {
        return core::result::Result::Err($crate::error::Error::with_msg($errno, $msg))
    };
}
