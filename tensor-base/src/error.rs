//! Generic error type returned by the recoverable paths of the runtime.
//!
//! Most failure modes in this crate are *not* represented here. Programmer
//! errors — an unknown op name, a shape mismatch, reading an uninitialized
//! tensor — are contract violations and escalate to `panic!` rather than
//! being threaded through `Result`, matching the convention used throughout
//! the host engine's own device layer. `Error` exists only for the two
//! causes that a well-behaved caller can legitimately hit at runtime and
//! that the command stream knows how to react to: running out of device
//! memory, and the device becoming unusable out from under us.

use std::fmt;

/// Category of a recoverable runtime error.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Ran out of device memory while encoding or materializing a buffer.
    ///
    /// Caught by the command stream (`tensor-runtime::command_stream`),
    /// which retries once after forcing a barrier; see that module for the
    /// retry protocol.
    OutOfDeviceMemory,
    /// The device (or the simulated backend) reported a fatal, unrecoverable
    /// condition: a command buffer finished in an error state, a pipeline
    /// failed to build, or similar driver-level failure.
    DeviceLost,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::OutOfDeviceMemory => "out of device memory",
            ErrorKind::DeviceLost => "device lost",
        }
    }
}

/// The error type used across the runtime's recoverable code paths.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{context}", kind = .kind.as_str(), context = DisplayContext(.detail.as_deref()))]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
}

struct DisplayContext<'a>(Option<&'a str>);

impl fmt::Display for DisplayContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(detail) => write!(f, ": {detail}"),
            None => Ok(()),
        }
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, detail: None }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Aborts the process with a diagnostic, for the "programmer error" class of
/// failure: wrong op name, dtype/shape mismatch, reading a tensor
/// before it is initialized, and similar API-contract violations. These are
/// not recoverable and intentionally do not produce an `Error` value, the
/// same exclusion this runtime's error module has always drawn around
/// "invalid usage" causes.
#[track_caller]
pub fn fatal_contract_violation(message: impl fmt::Display) -> ! {
    log::error!("tensor runtime contract violation: {message}");
    panic!("tensor runtime contract violation: {message}");
}
