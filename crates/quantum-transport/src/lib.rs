//! Quantum: a reliable datagram transport over UDP.
//!
//! Custom wire format with a fixed big-endian header, cumulative ACK plus
//! SACK, fast and timeout-based ARQ retransmission, BBR-style congestion
//! control, and an optional systematic Reed-Solomon forward error
//! correction layer riding alongside ARQ rather than replacing it.
//!
//! [`Connection::dial`] and [`Connection::listen`] perform the handshake and
//! return a handle backed by four cooperative background tasks (send,
//! receive, reliability, keepalive); [`Connection::send`] /
//! [`Connection::receive`] move payloads across it.

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod fec;
pub mod id;
pub mod io;
pub mod pool;
pub mod receive_buffer;
pub mod send_buffer;
pub mod stats;
pub mod wire;

pub use config::{BbrConfig, FecConfig, QuantumConfig, TransportConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{DialError, ListenError, ReceiveError, SendError};
pub use id::ConnectionId;
pub use stats::StatsSnapshot;
