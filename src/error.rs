//! Error types for rdmsg.

use std::fmt;

/// Error type for endpoint operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying transport.
    Io(std::io::Error),
    /// Transient back-pressure; the operation should be retried later.
    ///
    /// Internal send paths recover from this by queueing; it reaches the
    /// application only from submission paths when no resources are free.
    Again,
    /// Destination address is not in the address vector.
    AddrNotAvail,
    /// The endpoint is not in a state that allows the operation.
    InvalidState(&'static str),
    /// An argument failed validation.
    InvalidArg(&'static str),
    /// IO vector has more segments than the endpoint supports.
    IovLimitExceeded { count: usize, limit: usize },
    /// Message does not fit the selected wire protocol.
    MessageTooLarge { size: usize, max: usize },
    /// The transport does not implement the requested operation.
    OpNotSupported,
    /// Memory registration failed.
    MrRegFailed,
    /// A required object has not been bound to the endpoint.
    NotBound(&'static str),
    /// Invalid packet received from the wire.
    InvalidPacket,
    /// Invalid magic byte in a packet header.
    InvalidMagic { expected: u8, got: u8 },
    /// Unknown packet type byte.
    InvalidPacketType(u8),
    /// Unrecoverable transport-level error code.
    Transport(i32),
    /// Invalid configuration.
    InvalidConfig(String),
}

impl Error {
    /// Numeric code written into user-visible error completions.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(_) => 5,
            Error::Again => 11,
            Error::AddrNotAvail => 99,
            Error::InvalidState(_) => 107,
            Error::InvalidArg(_) | Error::InvalidConfig(_) => 22,
            Error::IovLimitExceeded { .. } => 22,
            Error::MessageTooLarge { .. } => 90,
            Error::OpNotSupported => 95,
            Error::MrRegFailed => 12,
            Error::NotBound(_) => 107,
            Error::InvalidPacket | Error::InvalidMagic { .. } | Error::InvalidPacketType(_) => 74,
            Error::Transport(code) => *code,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Again => write!(f, "Resource temporarily unavailable"),
            Error::AddrNotAvail => write!(f, "Address not in address vector"),
            Error::InvalidState(what) => write!(f, "Invalid endpoint state: {}", what),
            Error::InvalidArg(what) => write!(f, "Invalid argument: {}", what),
            Error::IovLimitExceeded { count, limit } => {
                write!(f, "IO vector too long: {} segments, limit {}", count, limit)
            }
            Error::MessageTooLarge { size, max } => {
                write!(f, "Message too large: {} bytes, max {} bytes", size, max)
            }
            Error::OpNotSupported => write!(f, "Operation not supported by transport"),
            Error::MrRegFailed => write!(f, "Memory registration failed"),
            Error::NotBound(what) => write!(f, "Endpoint is missing a bound {}", what),
            Error::InvalidPacket => write!(f, "Invalid packet received"),
            Error::InvalidMagic { expected, got } => {
                write!(f, "Invalid magic: expected {:#x}, got {:#x}", expected, got)
            }
            Error::InvalidPacketType(t) => write!(f, "Invalid packet type: {}", t),
            Error::Transport(code) => write!(f, "Transport error: {}", code),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
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

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;
