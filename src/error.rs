//! The error taxonomy shared by the host-side API and the monitor's wire
//! protocol. Every fallible operation in this crate returns (or, on the
//! wire, carries) one of these kinds; `Error::kind()` maps a rich,
//! `thiserror`-derived variant back down to the single byte sent over the
//! channel and control pipe.

use crate::bounded::BoundedString;

/// Numeric error kind, stable across the wire. `Ok` is reserved for the
/// zero-byte "no error" status in a reply frame and is never constructed
/// as an `Error` value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok = 0,
    NotInitialized = 1,
    AlreadyInitialized = 2,
    InvalidConfig = 3,
    ForkFailed = 4,
    SocketFailed = 5,
    HandshakeFailed = 6,
    ChannelClosed = 7,
    ProtocolViolation = 8,
    QueueFull = 9,
    TimedOut = 10,
    SpawnFailed = 11,
    TracerNonzeroExit = 12,
    PermissionDenied = 13,
    ResourceLimit = 14,
}

impl ErrorKind {
    /// Recovers a kind from its wire byte. Unknown bytes are treated as a
    /// protocol violation rather than a panic: the peer is untrusted input.
    pub fn from_wire(byte: u8) -> ErrorKind {
        match byte {
            0 => ErrorKind::Ok,
            1 => ErrorKind::NotInitialized,
            2 => ErrorKind::AlreadyInitialized,
            3 => ErrorKind::InvalidConfig,
            4 => ErrorKind::ForkFailed,
            5 => ErrorKind::SocketFailed,
            6 => ErrorKind::HandshakeFailed,
            7 => ErrorKind::ChannelClosed,
            9 => ErrorKind::QueueFull,
            10 => ErrorKind::TimedOut,
            11 => ErrorKind::SpawnFailed,
            12 => ErrorKind::TracerNonzeroExit,
            13 => ErrorKind::PermissionDenied,
            14 => ErrorKind::ResourceLimit,
            _ => ErrorKind::ProtocolViolation,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// The maximum length, in bytes, of a bounded error message. Chosen to fit
/// comfortably inside a single reply frame alongside its length prefix.
pub const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// The opaque diagnostic carrier described by the data model: a kind plus a
/// short human message. `thiserror` gives us `Display`/`std::error::Error`
/// for free while `kind()` and `bounded_message()` provide the wire-level
/// projection the protocol needs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bcd has not been initialized")]
    NotInitialized,
    #[error("bcd has already been initialized in this process")]
    AlreadyInitialized,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to fork the monitor process: {0}")]
    ForkFailed(#[source] nix::Error),
    #[error("failed to create or bind the monitor listen socket: {0}")]
    SocketFailed(#[source] std::io::Error),
    #[error("handshake with the monitor failed: {0}")]
    HandshakeFailed(String),
    #[error("the channel to the monitor is closed")]
    ChannelClosed,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("the monitor's request queue is full")]
    QueueFull,
    #[error("the tracer invocation timed out")]
    TimedOut,
    #[error("failed to spawn the tracer: {0}")]
    SpawnFailed(String),
    #[error("the tracer exited with non-zero status {0}")]
    TracerNonzeroExit(i32),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl Error {
    /// Maps this error down to its wire-level kind. Used both when a host
    /// thread needs to route a failure to the request-error callback and
    /// when the monitor writes a reply frame's status byte.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::ForkFailed(_) => ErrorKind::ForkFailed,
            Error::SocketFailed(_) => ErrorKind::SocketFailed,
            Error::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            Error::ChannelClosed => ErrorKind::ChannelClosed,
            Error::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Error::QueueFull => ErrorKind::QueueFull,
            Error::TimedOut => ErrorKind::TimedOut,
            Error::SpawnFailed(_) => ErrorKind::SpawnFailed,
            Error::TracerNonzeroExit(_) => ErrorKind::TracerNonzeroExit,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::ResourceLimit(_) => ErrorKind::ResourceLimit,
        }
    }

    /// Reconstructs a (kind, message) pair into an `Error`. Used by the
    /// host side when decoding a non-OK reply frame from the monitor.
    pub fn from_kind_and_message(kind: ErrorKind, message: String) -> Error {
        match kind {
            ErrorKind::Ok => Error::ProtocolViolation("OK status carried an error".into()),
            ErrorKind::NotInitialized => Error::NotInitialized,
            ErrorKind::AlreadyInitialized => Error::AlreadyInitialized,
            ErrorKind::InvalidConfig => Error::InvalidConfig(message),
            ErrorKind::ForkFailed => Error::SpawnFailed(message),
            ErrorKind::SocketFailed => {
                Error::SpawnFailed(format!("socket failure relayed from monitor: {message}"))
            }
            ErrorKind::HandshakeFailed => Error::HandshakeFailed(message),
            ErrorKind::ChannelClosed => Error::ChannelClosed,
            ErrorKind::ProtocolViolation => Error::ProtocolViolation(message),
            ErrorKind::QueueFull => Error::QueueFull,
            ErrorKind::TimedOut => Error::TimedOut,
            ErrorKind::SpawnFailed => Error::SpawnFailed(message),
            ErrorKind::TracerNonzeroExit => Error::TracerNonzeroExit(message.parse().unwrap_or(-1)),
            ErrorKind::PermissionDenied => Error::PermissionDenied(message),
            ErrorKind::ResourceLimit => Error::ResourceLimit(message),
        }
    }

    /// The bounded, C-string-compatible message accessor required by
    /// `error_message()`. Truncates silently rather than failing: a
    /// diagnostic message must never itself become a fallible operation.
    pub fn bounded_message(&self) -> BoundedString<MAX_ERROR_MESSAGE_LEN> {
        BoundedString::truncated(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_for_every_kind() {
        let kinds = [
            ErrorKind::Ok,
            ErrorKind::NotInitialized,
            ErrorKind::AlreadyInitialized,
            ErrorKind::InvalidConfig,
            ErrorKind::ForkFailed,
            ErrorKind::SocketFailed,
            ErrorKind::HandshakeFailed,
            ErrorKind::ChannelClosed,
            ErrorKind::ProtocolViolation,
            ErrorKind::QueueFull,
            ErrorKind::TimedOut,
            ErrorKind::SpawnFailed,
            ErrorKind::TracerNonzeroExit,
            ErrorKind::PermissionDenied,
            ErrorKind::ResourceLimit,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_wire(kind.to_wire()), kind);
        }
    }

    #[test]
    fn unknown_wire_byte_is_protocol_violation() {
        assert_eq!(ErrorKind::from_wire(200), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn bounded_message_truncates_long_errors() {
        let err = Error::InvalidConfig("x".repeat(10_000));
        assert!(err.bounded_message().as_str().len() <= MAX_ERROR_MESSAGE_LEN);
    }
}
