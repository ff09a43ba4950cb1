use std::os::fd::RawFd;

use libc::c_int;
use nix::errno::Errno;
use thiserror::Error;

/// Errors raised while parsing the window descriptor.
///
/// All of these are fatal: an interception layer running with a wrong or
/// missing window is unsafe, so the preload shim terminates the process
/// instead of degrading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    /// The descriptor environment variable is not set.
    #[error("window descriptor not set (expected {0}=path,offset,length[,mode])")]
    Missing(&'static str),

    /// A required field is absent from the descriptor.
    #[error("window descriptor is missing the {0} field")]
    MissingField(&'static str),

    /// A numeric field did not parse.
    #[error("window {field} is not a number: {value:?}")]
    BadNumber {
        /// Which field failed to parse.
        field: &'static str,
        /// The raw text of the field.
        value: String,
    },

    /// The window has zero length.
    #[error("window length must be greater than zero")]
    EmptyWindow,

    /// The window end does not fit in the file-offset domain.
    #[error("window end {base} + {length} exceeds the 64-bit file-offset domain")]
    Overflow {
        /// Configured start of the window.
        base: u64,
        /// Configured length of the window.
        length: u64,
    },
}

/// Errors raised by the operation interceptor.
///
/// Recoverable variants surface to the calling tool through the normal
/// error-return channel of the intercepted operation ([`Self::errno`]).
/// Fatal variants ([`Self::is_fatal`]) mean descriptor tracking or usage has
/// diverged in a way that would silently corrupt the window illusion; the
/// preload shim terminates the process when it sees one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterceptError {
    /// A window-relative offset fell outside the window.
    #[error("offset {offset} is outside the {length}-byte window")]
    OutOfWindow {
        /// The rejected window-relative offset.
        offset: i64,
        /// Length of the configured window.
        length: u64,
    },

    /// A space-allocation request fell outside the window.
    #[error("allocation at offset {offset} exceeds the {length}-byte window")]
    AllocOutOfWindow {
        /// The rejected window-relative offset.
        offset: i64,
        /// Length of the configured window.
        length: u64,
    },

    /// The underlying seek did not land on the requested absolute offset.
    #[error("seek landed at {got} instead of absolute offset {want}")]
    SeekMismatch {
        /// The translated absolute offset that was requested.
        want: u64,
        /// What the underlying seek actually returned.
        got: i64,
    },

    /// No free slot in the descriptor registry.
    #[error("descriptor registry is full ({capacity} tracked descriptors)")]
    RegistryFull {
        /// Fixed capacity of the registry.
        capacity: usize,
    },

    /// A descriptor expected to be tracked was not.
    #[error("descriptor {0} is not tracked")]
    UntrackedDescriptor(RawFd),

    /// A descriptor was registered twice without an intervening close.
    #[error("descriptor {0} is already tracked")]
    DuplicateDescriptor(RawFd),

    /// A tracked descriptor was repositioned with an unsupported origin.
    #[error("unsupported seek origin {whence} on tracked descriptor {fd}")]
    UnsupportedWhence {
        /// The tracked descriptor.
        fd: RawFd,
        /// The rejected `whence` value.
        whence: c_int,
    },
}

impl InterceptError {
    /// Whether this error must terminate the process.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::RegistryFull { .. }
                | Self::UntrackedDescriptor(_)
                | Self::DuplicateDescriptor(_)
                | Self::UnsupportedWhence { .. }
        )
    }

    /// The errno reported to the caller for recoverable errors.
    #[must_use]
    pub fn errno(&self) -> Errno {
        match self {
            Self::AllocOutOfWindow { .. } => Errno::ENOSPC,
            _ => Errno::EINVAL,
        }
    }
}

/// Convenience result type for interceptor operations.
pub type InterceptResult<T> = Result<T, InterceptError>;
