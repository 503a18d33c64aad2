//! Session-level error representations.

use std::{fmt, io};

/// The error type for session multiplexing operations.
///
/// Framing and I/O variants are fatal to the session that produced
/// them; `Handler` errors are per-request and are translated into a
/// wire-level error response instead of tearing the session down.
#[derive(Debug)]
pub enum Error {
    /// Underlying transport I/O failed
    Io(io::Error),
    /// The peer sent bytes that cannot be a legal 9P message
    Framing(FramingError),
    /// The session has already transitioned to closing/closed
    ConnectionClosed,
    /// A message handler failed to produce a response
    Handler(String),
}

/// Ways the byte stream can fail to parse as 9P framing.
///
/// Resynchronizing a byte stream after any of these is not reliably
/// possible, so they all terminate the session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FramingError {
    /// Declared `size` is below the seven-byte minimum
    SizeTooSmall(u32),
    /// Declared `size` exceeds the session's maximum message size
    SizeTooLarge(u32),
    /// A `TFlush` body was shorter than its two-byte `oldtag`
    TruncatedFlush(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Framing(e) => write!(f, "framing error: {e}"),
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Handler(msg) => write!(f, "handler error: {msg}"),
        }
    }
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FramingError::SizeTooSmall(size) => {
                write!(f, "message size {size} below minimum of 7")
            }
            FramingError::SizeTooLarge(size) => {
                write!(f, "message size {size} exceeds maximum")
            }
            FramingError::TruncatedFlush(len) => {
                write!(f, "TFlush body of {len} bytes is missing oldtag")
            }
        }
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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<FramingError> for Error {
    fn from(e: FramingError) -> Self {
        Error::Framing(e)
    }
}
