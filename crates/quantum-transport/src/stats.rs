//! Per-connection statistics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Lock-free counters updated from the connection's tasks; read via
/// [`ConnectionStats::snapshot`] for a point-in-time view.
pub struct ConnectionStats {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    retransmissions: AtomicU64,
    fast_retrans: AtomicU64,
    timeout_retrans: AtomicU64,
    fec_recovered: AtomicU64,
    fec_failed: AtomicU64,
    duplicates: AtomicU64,
    io_errors: AtomicU64,
    overflow: AtomicU64,
    /// Set once, at connection construction: elapsed time between the
    /// first handshake packet and the handshake's completion.
    handshake_rtt: Duration,
}

/// Serializable point-in-time snapshot, matching the external
/// `Statistics()` contract plus diagnostic extras.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub fec_recovered: u64,
    pub fec_failed: u64,
    pub fast_retrans: u64,
    pub timeout_retrans: u64,
    pub duplicates: u64,
    pub io_errors: u64,
    pub overflow: u64,
    #[serde(with = "opt_duration_millis")]
    pub srtt: Option<Duration>,
    #[serde(with = "duration_millis")]
    pub rto: Duration,
    #[serde(with = "duration_millis")]
    pub rttvar: Duration,
    #[serde(with = "duration_millis")]
    pub handshake_rtt: Duration,
}

impl ConnectionStats {
    pub fn new(handshake_rtt: Duration) -> Self {
        ConnectionStats {
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            fast_retrans: AtomicU64::new(0),
            timeout_retrans: AtomicU64::new(0),
            fec_recovered: AtomicU64::new(0),
            fec_failed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            handshake_rtt,
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_retransmission(&self) {
        self.retransmissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fast_retrans(&self, n: u64) {
        self.fast_retrans.fetch_add(n, Ordering::Relaxed);
        self.retransmissions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_timeout_retrans(&self, n: u64) {
        self.timeout_retrans.fetch_add(n, Ordering::Relaxed);
        self.retransmissions.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_fec_recovered(&self, n: u64) {
        self.fec_recovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_fec_failed(&self) {
        self.fec_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, srtt: Option<Duration>, rto: Duration, rttvar: Duration) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.retransmissions.load(Ordering::Relaxed),
            fec_recovered: self.fec_recovered.load(Ordering::Relaxed),
            fec_failed: self.fec_failed.load(Ordering::Relaxed),
            fast_retrans: self.fast_retrans.load(Ordering::Relaxed),
            timeout_retrans: self.timeout_retrans.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            srtt,
            rto,
            rttvar,
            handshake_rtt: self.handshake_rtt,
        }
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

mod opt_duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}
