//! Datagram I/O: owns the OS endpoint, applies socket buffer sizing, and
//! exposes `send_datagram`/`receive_datagram` with counters. No retry —
//! errors are surfaced to the owning connection.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use socket2::Socket;
use tokio::net::UdpSocket;

use crate::config::TransportConfig;
use crate::pool::PACKET_POOL;
use crate::wire::MAX_HEADER_LEN;

/// Largest single read: a full header plus the maximum payload.
const RECV_SCRATCH_LEN: usize = MAX_HEADER_LEN + crate::wire::MAX_PAYLOAD;

#[derive(Default)]
pub struct IoCounters {
    pub datagrams_out: AtomicU64,
    pub datagrams_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub io_errors: AtomicU64,
}

pub struct DatagramIo {
    socket: UdpSocket,
    read_timeout: Duration,
    counters: IoCounters,
}

impl DatagramIo {
    /// Bind a local endpoint, applying `config`'s socket buffer sizes.
    pub async fn bind(local_addr: SocketAddr, config: &TransportConfig) -> io::Result<Self> {
        let domain = if local_addr.is_ipv6() {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let sock = Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.set_recv_buffer_size(config.read_buffer_bytes)?;
        sock.set_send_buffer_size(config.write_buffer_bytes)?;
        sock.bind(&local_addr.into())?;

        let std_socket: std::net::UdpSocket = sock.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(DatagramIo {
            socket,
            read_timeout: config.read_timeout,
            counters: IoCounters::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn send_datagram(&self, bytes: &[u8], remote_addr: SocketAddr) -> io::Result<usize> {
        match self.socket.send_to(bytes, remote_addr).await {
            Ok(n) => {
                self.counters.datagrams_out.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                Ok(n)
            }
            Err(e) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Suspends until a datagram arrives or `read_timeout` elapses. The
    /// scratch buffer for the read comes from the process-wide packet
    /// pool rather than a fresh per-call allocation.
    pub async fn receive_datagram(&self) -> io::Result<Option<(Bytes, SocketAddr)>> {
        let mut scratch = PACKET_POOL.acquire();
        scratch.resize(RECV_SCRATCH_LEN, 0);
        let read_buf: &mut [u8] = &mut scratch;
        match tokio::time::timeout(self.read_timeout, self.socket.recv_from(read_buf)).await {
            Ok(Ok((n, source))) => {
                self.counters.datagrams_in.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                let received: &[u8] = &scratch;
                Ok(Some((Bytes::copy_from_slice(&received[..n]), source)))
            }
            Ok(Err(e)) => {
                self.counters.io_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Err(_elapsed) => Ok(None),
        }
    }

    pub fn counters(&self) -> &IoCounters {
        &self.counters
    }
}
