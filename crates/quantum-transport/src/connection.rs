//! Connection lifecycle: the handshake, the four cooperative background
//! tasks (send, receive, reliability, keepalive), and the public
//! [`Connection`] handle that drives them.
//!
//! FEC integration note: a data shard's bytes, as fed to [`FecEncoder`], are
//! `[original_seq:4][user_payload]` rather than the bare payload. This lets
//! a shard reconstructed purely from parity still carry the ARQ sequence
//! number it needs to be re-admitted into [`ReceiveBuffer`] in order, without
//! adding a dedicated wire field for it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use quanta::Instant;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::QuantumConfig;
use crate::congestion::BbrController;
use crate::error::{DialError, ListenError, ReceiveError, SendError};
use crate::fec::{FecDecoder, FecEncoder, FecShardHeader, FEC_HEADER_LEN};
use crate::id::ConnectionId;
use crate::io::DatagramIo;
use crate::pool::PACKET_POOL;
use crate::receive_buffer::{AddOutcome, ReceiveBuffer};
use crate::send_buffer::SendBuffer;
use crate::stats::{ConnectionStats, StatsSnapshot};
use crate::wire::{Flags, Header, Packet, MAX_PAYLOAD};

/// Bound on the outbound/inbound mpsc queues.
const QUEUE_CAPACITY: usize = 1024;
/// How long `Connection::send` waits for outbound queue space.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `Dial`/`Listen` wait for the handshake to complete.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Interval between handshake packet retries.
const HANDSHAKE_RETRY: Duration = Duration::from_millis(500);
/// Reliability task tick.
const RELIABILITY_TICK: Duration = Duration::from_millis(10);
/// How many sealed FEC groups the decoder retains at once.
const FEC_GROUP_HISTORY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Established,
    Closing,
    Closed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Init => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Established => 2,
            ConnectionState::Closing => 3,
            ConnectionState::Closed => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Init,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Established,
            3 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Shared connection state, reachable from every background task.
struct Shared {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    state_raw: AtomicU8,
    config: QuantumConfig,
    io: DatagramIo,
    send_buffer: RwLock<SendBuffer>,
    recv_buffer: RwLock<ReceiveBuffer>,
    bbr: RwLock<BbrController>,
    fec_encoder: Option<AsyncMutex<FecEncoder>>,
    fec_decoder: Option<AsyncMutex<FecDecoder>>,
    stats: ConnectionStats,
    close_notify: Notify,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state_raw.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectionState) {
        self.state_raw.store(s.to_u8(), Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Build, validate-encode, and send a packet; `reliable` packets are
    /// tracked in the send buffer for retransmission, matching the rule
    /// that pure keepalive/ack-refresh packets are not.
    async fn transmit(&self, mut flags: Flags, wire_payload: Bytes, reliable: bool) -> io::Result<u32> {
        flags.set(Flags::ACK);
        let (ack_number, sack_blocks) = self.recv_buffer.read().await.generate_sack();
        let seq = self.send_buffer.read().await.next_seq();

        let mut header = Header::new(self.id.as_u128(), seq, ack_number);
        header.flags = flags;
        header.sack_blocks = sack_blocks;
        let packet = Packet::new(header, wire_payload);

        let mut scratch = PACKET_POOL.acquire();
        packet
            .encode_into(&mut scratch)
            .expect("header fields validated by construction");
        let encoded = Bytes::copy_from_slice(&scratch);
        drop(scratch);

        self.io.send_datagram(&encoded, self.remote_addr).await?;
        let now = Instant::now();
        if reliable {
            self.send_buffer.write().await.add_packet(encoded.clone(), now);
            self.bbr.write().await.on_packet_sent(encoded.len(), now);
        }
        self.stats.record_sent(encoded.len());
        Ok(seq)
    }

    /// Encode one user payload, running it through FEC first if enabled,
    /// and transmit the resulting data (and, if a group just sealed,
    /// parity) packets.
    async fn send_data_packet(&self, payload: Bytes) -> io::Result<()> {
        let mut flags = Flags::empty();
        if !payload.is_empty() {
            flags.set(Flags::PSH);
        }

        let wire_payload;
        let mut sealed: (Option<u64>, Option<Vec<Bytes>>) = (None, None);
        let mut fec_k = 0usize;

        if let Some(encoder) = &self.fec_encoder {
            let seq = self.send_buffer.read().await.next_seq();
            let shard_content = prefix_seq(seq, &payload);

            let mut enc = encoder.lock().await;
            let group_id = enc.current_group_id() as u32;
            let shard_index = enc.open_len() as u8;
            fec_k = enc.k();

            let mut buf = BytesMut::with_capacity(FEC_HEADER_LEN + shard_content.len());
            FecShardHeader { group_id, shard_index, is_parity: false }.encode(&mut buf);
            buf.extend_from_slice(&shard_content);
            wire_payload = buf.freeze();
            flags.set(Flags::FEC);
            sealed = enc.add_data(shard_content);
        } else {
            wire_payload = payload;
        }

        self.transmit(flags, wire_payload, true).await?;

        if let (Some(group_id), Some(parity_shards)) = sealed {
            for (i, parity) in parity_shards.into_iter().enumerate() {
                let mut buf = BytesMut::with_capacity(FEC_HEADER_LEN + parity.len());
                FecShardHeader { group_id: group_id as u32, shard_index: (fec_k + i) as u8, is_parity: true }
                    .encode(&mut buf);
                buf.extend_from_slice(&parity);
                let mut parity_flags = Flags::empty();
                parity_flags.set(Flags::FEC);
                self.transmit(parity_flags, buf.freeze(), true).await?;
            }
        }
        Ok(())
    }

    /// Admit a payload at `seq` into the receive buffer and hand any
    /// now-deliverable (non-empty) payloads to the user channel.
    async fn deliver_and_ack(&self, seq: u32, payload: Bytes, inbound_tx: &mpsc::Sender<Bytes>) -> AddOutcome {
        let (delivered, outcome) = self.recv_buffer.write().await.add_packet(seq, payload);
        match outcome {
            AddOutcome::Duplicate => self.stats.record_duplicate(),
            AddOutcome::BufferOverflow => self.stats.record_overflow(),
            AddOutcome::Ok => {}
        }
        for record in delivered {
            if !record.payload.is_empty() {
                let _ = inbound_tx.send(record.payload).await;
            }
        }
        outcome
    }

    async fn feed_fec_decoder(&self, sh: FecShardHeader, shard_body: Bytes, inbound_tx: &mpsc::Sender<Bytes>) {
        let Some(decoder) = &self.fec_decoder else {
            return;
        };

        let result = {
            let mut dec = decoder.lock().await;
            let result = dec.add_shard(sh.group_id as u64, sh.shard_index, shard_body, sh.is_parity);
            if matches!(result, Ok(Some(_))) {
                dec.cleanup_old_groups(FEC_GROUP_HISTORY);
            }
            result
        };

        match result {
            Ok(Some(blobs)) => {
                let mut recovered = 0u64;
                for blob in blobs {
                    let (seq, payload) = unprefix_seq(blob);
                    if self.deliver_and_ack(seq, payload, inbound_tx).await == AddOutcome::Ok {
                        recovered += 1;
                    }
                }
                if recovered > 0 {
                    self.stats.record_fec_recovered(recovered);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, group = sh.group_id, "fec reconstruction failed");
                self.stats.record_fec_failed();
            }
        }
    }

    async fn admit_packet(&self, header: &Header, payload: Bytes, inbound_tx: &mpsc::Sender<Bytes>) {
        if !header.flags.is_fec() {
            self.deliver_and_ack(header.sequence_number, payload, inbound_tx).await;
            return;
        }

        let mut rest = payload;
        let shard_header = match FecShardHeader::decode(&mut rest) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "dropping malformed fec sub-header");
                return;
            }
        };

        if shard_header.is_parity {
            // Occupies an ARQ slot so it stops being retransmitted, but
            // carries nothing deliverable.
            self.deliver_and_ack(header.sequence_number, Bytes::new(), inbound_tx).await;
        } else {
            let mut direct = rest.clone();
            if direct.remaining() >= 4 {
                let _seq_echo = direct.get_u32();
                self.deliver_and_ack(header.sequence_number, direct, inbound_tx).await;
            }
        }

        self.feed_fec_decoder(shard_header, rest, inbound_tx).await;
    }

    async fn on_packet(&self, packet: Packet, inbound_tx: &mpsc::Sender<Bytes>) {
        let header = &packet.header;

        if header.flags.is_rst() {
            self.set_state(ConnectionState::Closed);
            self.close_notify.notify_waiters();
            return;
        }

        let now = Instant::now();
        let newly_acked = self
            .send_buffer
            .write()
            .await
            .handle_ack(header.ack_number, &header.sack_blocks, now);
        if !newly_acked.is_empty() {
            let srtt = self.send_buffer.read().await.srtt();
            if let Some(rtt) = srtt {
                let mut bbr = self.bbr.write().await;
                for _ in &newly_acked {
                    bbr.on_packet_acked(MAX_PAYLOAD, rtt, now);
                }
            }
        }

        if header.flags.is_fin() {
            // Drive straight to Closed, the same teardown state
            // `Connection::close()` sets: every background task already
            // checks `is_closed()`/races `close_notify` each iteration, so
            // this alone unwinds all four loops without a forced abort.
            self.set_state(ConnectionState::Closed);
            self.close_notify.notify_waiters();
            return;
        }

        let is_pure_control = header.payload_length == 0 && !header.flags.is_fec();
        if is_pure_control {
            return;
        }

        self.admit_packet(header, packet.payload.clone(), inbound_tx).await;
    }
}

fn prefix_seq(seq: u32, payload: &Bytes) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(seq);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn unprefix_seq(mut blob: Bytes) -> (u32, Bytes) {
    let seq = blob.get_u32();
    (seq, blob)
}

fn wildcard_addr_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv6() {
        "[::]:0".parse().expect("valid literal")
    } else {
        "0.0.0.0:0".parse().expect("valid literal")
    }
}

fn control_packet(connection_id: u128, flag_bits: u8) -> Bytes {
    let mut header = Header::new(connection_id, 0, 0);
    header.flags = Flags::new(flag_bits);
    Packet::new(header, Bytes::new())
        .encode()
        .expect("zero-payload control header is always valid")
}

#[tracing::instrument(skip_all, fields(connection_id = %shared.id, remote = %shared.remote_addr))]
async fn send_task(shared: Arc<Shared>, mut outbound_rx: mpsc::Receiver<Bytes>) {
    loop {
        if shared.is_closed() {
            break;
        }

        if shared.send_buffer.read().await.window_available() == 0 {
            tokio::select! {
                biased;
                _ = shared.close_notify.notified() => break,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
            }
            continue;
        }

        let payload = tokio::select! {
            biased;
            _ = shared.close_notify.notified() => break,
            maybe = outbound_rx.recv() => match maybe {
                Some(p) => p,
                None => break,
            },
        };

        if let Err(e) = shared.send_data_packet(payload).await {
            shared.stats.record_io_error();
            warn!(error = %e, "send task: datagram send failed");
        }

        let delay = shared.bbr.read().await.pacing_delay(MAX_PAYLOAD);
        if !delay.is_zero() {
            tokio::select! {
                biased;
                _ = shared.close_notify.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[tracing::instrument(skip_all, fields(connection_id = %shared.id, remote = %shared.remote_addr))]
async fn receive_task(shared: Arc<Shared>, inbound_tx: mpsc::Sender<Bytes>) {
    loop {
        if shared.is_closed() {
            break;
        }

        let datagram = tokio::select! {
            biased;
            _ = shared.close_notify.notified() => break,
            r = shared.io.receive_datagram() => r,
        };

        let (raw, from) = match datagram {
            Ok(Some(pair)) => pair,
            Ok(None) => continue,
            Err(e) => {
                shared.stats.record_io_error();
                warn!(error = %e, "receive task: datagram read failed");
                continue;
            }
        };

        if from != shared.remote_addr {
            trace!(%from, "dropping datagram from unexpected peer");
            continue;
        }

        let packet = match Packet::decode(raw) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "dropping unparseable packet");
                continue;
            }
        };

        shared
            .stats
            .record_received(packet.header.header_len() + packet.payload.len());
        shared.on_packet(packet, &inbound_tx).await;
    }
}

#[tracing::instrument(skip_all, fields(connection_id = %shared.id))]
async fn reliability_task(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(RELIABILITY_TICK);
    loop {
        tokio::select! {
            biased;
            _ = shared.close_notify.notified() => break,
            _ = ticker.tick() => {}
        }
        if shared.is_closed() {
            break;
        }

        let now = Instant::now();
        let (fast, timed_out) = shared.send_buffer.write().await.detect_lost(now);
        if fast.is_empty() && timed_out.is_empty() {
            continue;
        }

        for &seq in fast.iter().chain(timed_out.iter()) {
            let packet = shared.send_buffer.read().await.get_packet(seq).cloned();
            if let Some(bytes) = packet {
                match shared.io.send_datagram(&bytes, shared.remote_addr).await {
                    Ok(_) => {
                        shared.bbr.write().await.on_packet_lost(bytes.len(), now);
                    }
                    Err(e) => {
                        shared.stats.record_io_error();
                        warn!(error = %e, seq, "retransmit failed");
                    }
                }
            }
        }
        if !fast.is_empty() {
            shared.stats.record_fast_retrans(fast.len() as u64);
        }
        if !timed_out.is_empty() {
            shared.stats.record_timeout_retrans(timed_out.len() as u64);
        }
    }
}

#[tracing::instrument(skip_all, fields(connection_id = %shared.id))]
async fn keepalive_task(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
    ticker.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            biased;
            _ = shared.close_notify.notified() => break,
            _ = ticker.tick() => {}
        }
        if shared.is_closed() {
            break;
        }
        if let Err(e) = shared.transmit(Flags::empty(), Bytes::new(), false).await {
            shared.stats.record_io_error();
            warn!(error = %e, "keepalive send failed");
        }
    }
}

/// A cloneable handle to an established connection. Internally `Arc`-backed;
/// clones share the same background tasks and queues.
pub struct Connection {
    inner: Arc<Shared>,
    outbound_tx: mpsc::Sender<Bytes>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Bytes>>,
    tasks: AsyncMutex<Vec<tokio::task::JoinHandle<()>>>,
    closing_once: AtomicBool,
}

impl Connection {
    /// Initiate a connection: SYN, retried every [`HANDSHAKE_RETRY`] until a
    /// SYN+ACK arrives or [`HANDSHAKE_TIMEOUT`] elapses, then ACK.
    pub async fn dial(remote_addr: SocketAddr, config: QuantumConfig) -> Result<Self, DialError> {
        let io = DatagramIo::bind(wildcard_addr_for(remote_addr), &config.transport).await?;
        let id = ConnectionId::generate();
        let syn = control_packet(id.as_u128(), Flags::SYN);

        let handshake_start = Instant::now();
        let deadline = handshake_start + HANDSHAKE_TIMEOUT;
        let peer_id = loop {
            if Instant::now() >= deadline {
                return Err(DialError::HandshakeTimeout);
            }
            io.send_datagram(&syn, remote_addr).await?;
            match timeout(HANDSHAKE_RETRY, io.receive_datagram()).await {
                Ok(Ok(Some((raw, from)))) if from == remote_addr => {
                    if let Ok(p) = Packet::decode(raw) {
                        if p.header.flags.is_syn() && p.header.flags.is_ack() {
                            break p.header.connection_id;
                        }
                    }
                }
                _ => {}
            }
        };

        let ack = control_packet(peer_id, Flags::ACK);
        io.send_datagram(&ack, remote_addr).await?;
        let handshake_rtt = handshake_start.elapsed();

        Ok(Connection::spawn(peer_id, io, remote_addr, config, handshake_rtt))
    }

    /// Accept a connection: wait for a SYN, reply SYN+ACK (retried every
    /// [`HANDSHAKE_RETRY`]) until the peer's final ACK arrives or
    /// [`HANDSHAKE_TIMEOUT`] elapses. Pre-established data packets arriving
    /// before the final ACK are ignored.
    pub async fn listen(local_addr: SocketAddr, config: QuantumConfig) -> Result<Self, ListenError> {
        let io = DatagramIo::bind(local_addr, &config.transport).await?;
        let handshake_start = Instant::now();

        let (remote_addr, connection_id) = loop {
            if let Some((raw, from)) = io.receive_datagram().await? {
                if let Ok(p) = Packet::decode(raw) {
                    if p.header.flags.is_syn() && !p.header.flags.is_ack() {
                        break (from, p.header.connection_id);
                    }
                }
            }
        };

        let syn_ack = control_packet(connection_id, Flags::SYN | Flags::ACK);
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(ListenError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer never acknowledged the handshake",
                )));
            }
            io.send_datagram(&syn_ack, remote_addr).await?;
            match timeout(HANDSHAKE_RETRY, io.receive_datagram()).await {
                Ok(Ok(Some((raw, from)))) if from == remote_addr => {
                    if let Ok(p) = Packet::decode(raw) {
                        if p.header.flags.is_ack() && !p.header.flags.is_syn() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        let handshake_rtt = handshake_start.elapsed();

        Ok(Connection::spawn(connection_id, io, remote_addr, config, handshake_rtt))
    }

    fn spawn(
        connection_id: u128,
        io: DatagramIo,
        remote_addr: SocketAddr,
        config: QuantumConfig,
        handshake_rtt: Duration,
    ) -> Connection {
        let local_addr = io.local_addr().unwrap_or_else(|_| wildcard_addr_for(remote_addr));

        let (fec_encoder, fec_decoder) = if config.fec.enabled {
            let k = config.fec.data_shards as usize;
            let m = config.fec.parity_shards as usize;
            (
                Some(AsyncMutex::new(FecEncoder::new(k, m))),
                Some(AsyncMutex::new(FecDecoder::new(k, m))),
            )
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared {
            id: ConnectionId::from_u128(connection_id),
            local_addr,
            remote_addr,
            state_raw: AtomicU8::new(ConnectionState::Established.to_u8()),
            send_buffer: RwLock::new(SendBuffer::new(config.send_window)),
            recv_buffer: RwLock::new(ReceiveBuffer::new(config.recv_window)),
            bbr: RwLock::new(BbrController::new(config.bbr.initial_cwnd_packets as u64, Instant::now())),
            fec_encoder,
            fec_decoder,
            stats: ConnectionStats::new(handshake_rtt),
            close_notify: Notify::new(),
            io,
            config,
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let tasks = vec![
            tokio::spawn(send_task(shared.clone(), outbound_rx)),
            tokio::spawn(receive_task(shared.clone(), inbound_tx)),
            tokio::spawn(reliability_task(shared.clone())),
            tokio::spawn(keepalive_task(shared.clone())),
        ];

        Connection {
            inner: shared,
            outbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            tasks: AsyncMutex::new(tasks),
            closing_once: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Enqueue `payload` for the send task. Waits up to 5 seconds for
    /// outbound queue space before giving up.
    pub async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        match self.inner.state() {
            ConnectionState::Closed | ConnectionState::Closing => return Err(SendError::ConnectionClosed),
            _ => {}
        }
        match timeout(ENQUEUE_TIMEOUT, self.outbound_tx.send(payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::ConnectionClosed),
            Err(_) => Err(SendError::EnqueueTimeout),
        }
    }

    /// Suspend until the next in-order payload is available.
    pub async fn receive(&self) -> Result<Bytes, ReceiveError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(ReceiveError::ConnectionClosed)
    }

    /// As [`Connection::receive`], but gives up after `timeout_duration`.
    pub async fn receive_with_timeout(&self, timeout_duration: Duration) -> Result<Bytes, ReceiveError> {
        let mut rx = self.inbound_rx.lock().await;
        match timeout(timeout_duration, rx.recv()).await {
            Ok(Some(p)) => Ok(p),
            Ok(None) => Err(ReceiveError::ConnectionClosed),
            Err(_) => Err(ReceiveError::Timeout),
        }
    }

    pub async fn statistics(&self) -> StatsSnapshot {
        let sb = self.inner.send_buffer.read().await;
        self.inner.stats.snapshot(sb.srtt(), sb.rto(), sb.rttvar())
    }

    /// Idempotent: sends a best-effort FIN, wakes every background task,
    /// and aborts them.
    pub async fn close(&self) {
        if self.closing_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.transmit(Flags::new(Flags::FIN), Bytes::new(), false).await;
        self.inner.set_state(ConnectionState::Closed);
        self.inner.close_notify.notify_waiters();
        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.set_state(ConnectionState::Closed);
        self.inner.close_notify.notify_waiters();
    }
}
