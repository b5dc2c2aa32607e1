//! Crate-wide error type.
//!
//! Every component in this crate returns one of the kinds below rather than
//! its own error enum; the top-level driver maps a kind straight to an exit
//! code (see `Error::exit_code`).

use std::fmt;
use std::io;

/// Errors returned when reading, testing or applying a firmware archive.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error {
    /// A system call failed (open/read/write/mmap/ioctl/mount/...).
    Io(io::Error),
    /// A binary structure failed a magic, size, or CRC/MD5 check.
    Format(String),
    /// The archive does not match the device with the strictness a slice requires.
    NotApplicable(String),
    /// A partition-table invariant was violated (non-adjacent OP/userdata, overlap, ...).
    Geometry(String),
    /// The target slice is currently mounted.
    BusyMount(String),
    /// The user declined a destructive confirmation.
    Aborted,
    /// A logic or sanity violation that should never occur.
    Internal(String),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Format(m) => write!(f, "format error: {m}"),
            Error::NotApplicable(m) => write!(f, "archive not applicable: {m}"),
            Error::Geometry(m) => write!(f, "partition geometry error: {m}"),
            Error::BusyMount(m) => write!(f, "target slice busy: {m}"),
            Error::Aborted => write!(f, "aborted by user"),
            Error::Internal(m) => write!(f, "internal error: {m}"),
        }
    }
}

impl Error {
    /// Maps an error to the process exit code described in the CLI surface.
    ///
    /// `0` is reserved for success and is never returned here.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotApplicable(_) => 8,
            _ => 1,
        }
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub(crate) fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub(crate) fn not_applicable(msg: impl Into<String>) -> Self {
        Self::NotApplicable(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
