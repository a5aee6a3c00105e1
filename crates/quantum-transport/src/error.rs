//! Typed error taxonomy for the transport.
//!
//! Every error that crosses the public [`crate::connection::Connection`] API
//! is one of the variants below. Wire-parse and transient I/O errors never
//! reach the caller directly — they are absorbed and counted (see
//! [`crate::stats`]); ARQ is the eventual-delivery safety net.

use thiserror::Error;

/// Failures from [`crate::wire::Header::decode`] and friends.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad magic number")]
    InvalidMagic,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("packet shorter than the minimum header size")]
    ShortPacket,
    #[error("malformed SACK block list")]
    BadSACK,
    #[error("payload exceeds the maximum segment size")]
    OversizedPayload,
}

/// Failures from [`crate::wire::Header::validate`] prior to encoding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("payload exceeds the maximum segment size")]
    OversizedPayload,
    #[error("more than 8 SACK blocks")]
    SackOverflow,
    #[error("SACK block start is greater than its end")]
    BadSackOrder,
    #[error("connection_id must not be zero")]
    ZeroConnectionId,
}

/// Failures from the FEC codec.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FecError {
    #[error("shard index {0} out of range for this group")]
    InvalidShardIndex(u8),
    #[error("reconstructed parity did not match received parity")]
    ReconstructionFailed,
}

/// Failures establishing a connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("handshake did not complete within the timeout")]
    HandshakeTimeout,
    #[error("I/O error while dialing: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures accepting an inbound connection.
#[derive(Debug, Error)]
pub enum ListenError {
    #[error("I/O error while listening: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures from `Connection::send`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("timed out waiting for outbound queue space")]
    EnqueueTimeout,
}

/// Failures from `Connection::receive` / `Connection::receive_with_timeout`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("timed out waiting for inbound data")]
    Timeout,
}
