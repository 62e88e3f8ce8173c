//! Error taxonomy for the wattbus driver
//!
//! Every operation in the driver returns (or publishes, as a `#` return-code
//! topic) one of these taxa. The `u8` codes are stable: they travel inside
//! return-code values and across the instrument wire protocol.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Driver-wide error taxa
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Unspecified failure
    #[error("unspecified error")]
    Unspecified,

    /// Allocation failure surfaced by a collaborator (allocation inside the
    /// driver itself aborts the process)
    #[error("out of memory")]
    OutOfMemory,

    /// Operation or protocol revision not supported
    #[error("not supported")]
    NotSupported,

    /// Transport input/output failure
    #[error("io error: {0}")]
    Io(String),

    /// Parameter failed validation
    #[error("parameter invalid: {0}")]
    ParameterInvalid(String),

    /// Request-style operation exceeded its timeout
    #[error("timed out")]
    TimedOut,

    /// Container at capacity
    #[error("full")]
    Full,

    /// Container empty
    #[error("empty")]
    Empty,

    /// Caller-provided buffer too small
    #[error("buffer too small")]
    TooSmall,

    /// Input exceeds an implementation bound
    #[error("too big")]
    TooBig,

    /// Topic or resource not found
    #[error("not found")]
    NotFound,

    /// Resource already exists
    #[error("already exists")]
    AlreadyExists,

    /// Operation not permitted
    #[error("permissions")]
    Permissions,

    /// Resource busy
    #[error("busy")]
    Busy,

    /// Device or service unavailable
    #[error("unavailable")]
    Unavailable,

    /// Resource held by another owner
    #[error("in use")]
    InUse,

    /// Endpoint or queue closed
    #[error("closed")]
    Closed,

    /// Operation out of sequence
    #[error("sequence violation")]
    Sequence,

    /// Operation aborted
    #[error("aborted")]
    Aborted,

    /// Data integrity check failed
    #[error("integrity check failed")]
    Integrity,

    /// Synchronization lost
    #[error("synchronization lost")]
    Synchronization,
}

impl Error {
    /// Stable wire code. `0` means success and is never produced by an
    /// `Error` value; it is what a return-code topic carries on the success
    /// path.
    pub const SUCCESS: u8 = 0;

    /// The wire code for this taxon.
    pub fn code(&self) -> u8 {
        match self {
            Error::Unspecified => 1,
            Error::OutOfMemory => 2,
            Error::NotSupported => 3,
            Error::Io(_) => 4,
            Error::ParameterInvalid(_) => 5,
            Error::TimedOut => 6,
            Error::Full => 7,
            Error::Empty => 8,
            Error::TooSmall => 9,
            Error::TooBig => 10,
            Error::NotFound => 11,
            Error::AlreadyExists => 12,
            Error::Permissions => 13,
            Error::Busy => 14,
            Error::Unavailable => 15,
            Error::InUse => 16,
            Error::Closed => 17,
            Error::Sequence => 18,
            Error::Aborted => 19,
            Error::Integrity => 20,
            Error::Synchronization => 21,
        }
    }

    /// Reconstruct a taxon from a wire code. `0` and unknown codes map to
    /// `None` and `Unspecified` respectively.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => return None,
            2 => Error::OutOfMemory,
            3 => Error::NotSupported,
            4 => Error::Io(String::new()),
            5 => Error::ParameterInvalid(String::new()),
            6 => Error::TimedOut,
            7 => Error::Full,
            8 => Error::Empty,
            9 => Error::TooSmall,
            10 => Error::TooBig,
            11 => Error::NotFound,
            12 => Error::AlreadyExists,
            13 => Error::Permissions,
            14 => Error::Busy,
            15 => Error::Unavailable,
            16 => Error::InUse,
            17 => Error::Closed,
            18 => Error::Sequence,
            19 => Error::Aborted,
            20 => Error::Integrity,
            21 => Error::Synchronization,
            _ => Error::Unspecified,
        })
    }
}
