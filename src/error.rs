use std::fmt;

/// A result of a library function that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid parameter.
    InvalidParam,

    /// No TimsSDR device was found.
    NotFound,

    /// The USB transport reported an error; the underlying code is carried
    /// for diagnostics.
    Usb(rusb::Error),

    /// `exit` was called while one or more devices are still open.
    NotLastDevice,

    /// Insufficient memory.
    NoMem,

    /// The transfer thread could not be started or joined.
    Thread,

    /// The device is busy, most likely already streaming.
    Busy,

    /// Unspecified error.
    Other,

    /// Streaming status: the transfer thread is not running.
    StreamingThreadErr,

    /// Streaming status: streaming has stopped.
    StreamingStopped,

    /// Streaming status: the device is shutting down.
    StreamingExitCalled,
}

impl Error {
    /// Returns a description of the error suitable for display to an end
    /// user.
    pub fn name(&self) -> &'static str {
        match *self {
            Error::InvalidParam => "invalid parameter(s)",
            Error::NotFound => "TimsSDR not found",
            Error::Usb(_) => "USB transport error",
            Error::NotLastDevice => "one or more TimsSDRs still in use",
            Error::NoMem => "insufficient memory",
            Error::Thread => "transfer thread error",
            Error::Busy => "TimsSDR busy",
            Error::Other => "unspecified error",
            Error::StreamingThreadErr => "streaming thread encountered an error",
            Error::StreamingStopped => "streaming stopped",
            Error::StreamingExitCalled => "streaming terminated",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usb(err) => write!(fmt, "USB transport error: {err}"),
            other => fmt.write_str(other.name()),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Usb(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        Error::Usb(err)
    }
}
