//! Per-connection send buffer: unacked packet tracking, fast/timeout
//! retransmit detection, and RFC-6298 RTO estimation.
//!
//! Keyed by sequence number in a `BTreeMap` for O(log n) lookup with
//! ordered traversal from `send_base` upward — the container shape the
//! design notes call out as equivalent to a `send_window`-sized ring
//! array. Sequence comparisons use RFC 1982 serial-number arithmetic
//! throughout so behavior is well-defined across the 32-bit wraparound.

use std::collections::BTreeMap;
use std::time::Duration;

use quanta::Instant;

use crate::wire::{seq_geq, seq_gt, seq_lt, SackBlock};

/// Default and bounds for the RTO estimator (RFC 6298).
pub const INITIAL_RTO: Duration = Duration::from_secs(1);
pub const MIN_RTO: Duration = Duration::from_millis(200);
pub const MAX_RTO: Duration = Duration::from_secs(60);

/// Consecutive higher acks past a sequence number before it is eligible
/// for fast retransmit.
const FAST_RETRANSMIT_THRESHOLD: u32 = 3;

/// A packet awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct SentRecord {
    pub seq: u32,
    pub packet: bytes::Bytes,
    pub send_time: Instant,
    pub retransmit_count: u32,
    pub timeout_deadline: Instant,
    pub acked: bool,
}

pub struct SendBuffer {
    packets: BTreeMap<u32, SentRecord>,
    next_seq: u32,
    send_base: u32,
    window_packets: u32,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    fast_retrans_count: u64,
    timeout_retrans_count: u64,
}

impl SendBuffer {
    pub fn new(window_packets: u32) -> Self {
        SendBuffer {
            packets: BTreeMap::new(),
            next_seq: 0,
            send_base: 0,
            window_packets,
            srtt: None,
            rttvar: Duration::ZERO,
            rto: INITIAL_RTO,
            fast_retrans_count: 0,
            timeout_retrans_count: 0,
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn send_base(&self) -> u32 {
        self.send_base
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    pub fn fast_retrans_count(&self) -> u64 {
        self.fast_retrans_count
    }

    pub fn timeout_retrans_count(&self) -> u64 {
        self.timeout_retrans_count
    }

    pub fn in_flight(&self) -> u32 {
        self.next_seq.wrapping_sub(self.send_base)
    }

    pub fn window_available(&self) -> u32 {
        self.window_packets.saturating_sub(self.in_flight())
    }

    pub fn update_window(&mut self, n: u32) {
        self.window_packets = n;
    }

    pub fn get_window(&self) -> u32 {
        self.window_packets
    }

    /// Record a packet as just handed to the I/O layer. Must be called
    /// after the datagram has actually been transmitted.
    pub fn add_packet(&mut self, packet: bytes::Bytes, now: Instant) -> u32 {
        let seq = self.next_seq;
        self.packets.insert(
            seq,
            SentRecord {
                seq,
                packet,
                send_time: now,
                retransmit_count: 0,
                timeout_deadline: now + self.rto,
                acked: false,
            },
        );
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Mark acked any record covered by the cumulative `ack_number` or by
    /// a SACK block, sample RTT for newly-acked records, and advance
    /// `send_base` past any contiguous run of acked records at the front.
    /// Returns the newly-acked sequence numbers.
    pub fn handle_ack(&mut self, ack_number: u32, sack_blocks: &[SackBlock], now: Instant) -> Vec<u32> {
        let mut newly_acked = Vec::new();

        for (&seq, record) in self.packets.iter_mut() {
            if record.acked {
                continue;
            }
            let covered = seq_lt(seq, ack_number) || sack_blocks.iter().any(|b| b.contains(seq));
            if covered {
                record.acked = true;
                newly_acked.push(seq);
            }
        }

        for &seq in &newly_acked {
            if let Some(record) = self.packets.get(&seq) {
                let rtt = now.saturating_duration_since(record.send_time);
                self.update_rto(rtt);
            }
        }

        // Advance send_base past any contiguous acked prefix, destroying
        // those records.
        loop {
            match self.packets.get(&self.send_base) {
                Some(record) if record.acked => {
                    self.packets.remove(&self.send_base);
                    self.send_base = self.send_base.wrapping_add(1);
                }
                _ => break,
            }
        }

        newly_acked
    }

    /// RFC 6298 RTO update: first sample sets srtt/rttvar directly,
    /// subsequent samples use alpha=1/8, beta=1/4.
    pub fn update_rto(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let diff = if rtt > srtt { rtt - srtt } else { srtt - rtt };
                self.rttvar = self.rttvar.mul_f64(0.75) + diff.mul_f64(0.25);
                self.srtt = Some(srtt.mul_f64(0.875) + rtt.mul_f64(0.125));
            }
        }
        let srtt = self.srtt.unwrap();
        let candidate = srtt + self.rttvar * 4;
        self.rto = candidate.clamp(MIN_RTO, MAX_RTO);
    }

    /// Find sequences eligible for fast or timeout retransmit. Idempotent:
    /// calling this repeatedly with no intervening acks/time only
    /// re-arms each record's deadline once, per the backoff rule below.
    pub fn detect_lost(&mut self, now: Instant) -> (Vec<u32>, Vec<u32>) {
        let highest_acked = self
            .packets
            .iter()
            .filter(|(&seq, r)| r.acked && seq_geq(seq, self.send_base))
            .map(|(&seq, _)| seq)
            .fold(None::<u32>, |acc, seq| match acc {
                None => Some(seq),
                Some(cur) if seq_gt(seq, cur) => Some(seq),
                Some(cur) => Some(cur),
            });

        let mut fast_retrans = Vec::new();
        let mut timeout_retrans = Vec::new();

        let seqs: Vec<u32> = self.packets.keys().copied().collect();
        for seq in seqs {
            let record = self.packets.get(&seq).unwrap();
            if record.acked {
                continue;
            }
            let eligible_fast = highest_acked
                .map(|hi| (hi.wrapping_sub(seq) as i32) >= FAST_RETRANSMIT_THRESHOLD as i32)
                .unwrap_or(false);

            if eligible_fast {
                fast_retrans.push(seq);
                let r = self.packets.get_mut(&seq).unwrap();
                r.send_time = now;
                r.timeout_deadline = now + self.rto;
                r.retransmit_count += 1;
                self.fast_retrans_count += 1;
            } else if now > record.timeout_deadline {
                timeout_retrans.push(seq);
                let r = self.packets.get_mut(&seq).unwrap();
                r.retransmit_count += 1;
                let backoff = 2u32.pow(r.retransmit_count.min(5));
                r.timeout_deadline = now + self.rto * backoff;
                self.timeout_retrans_count += 1;
            }
        }

        (fast_retrans, timeout_retrans)
    }

    pub fn get_packet(&self, seq: u32) -> Option<&bytes::Bytes> {
        self.packets.get(&seq).map(|r| &r.packet)
    }

    pub fn record(&self, seq: u32) -> Option<&SentRecord> {
        self.packets.get(&seq)
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn buf() -> SendBuffer {
        SendBuffer::new(256)
    }

    #[test]
    fn next_seq_increments_on_add() {
        let mut b = buf();
        let now = Instant::now();
        assert_eq!(b.next_seq(), 0);
        let seq = b.add_packet(Bytes::from_static(b"a"), now);
        assert_eq!(seq, 0);
        assert_eq!(b.next_seq(), 1);
    }

    #[test]
    fn window_available_shrinks_with_in_flight() {
        let mut b = SendBuffer::new(2);
        let now = Instant::now();
        assert_eq!(b.window_available(), 2);
        b.add_packet(Bytes::new(), now);
        assert_eq!(b.window_available(), 1);
        b.add_packet(Bytes::new(), now);
        assert_eq!(b.window_available(), 0);
    }

    #[test]
    fn cumulative_ack_advances_send_base_and_destroys_records() {
        let mut b = buf();
        let now = Instant::now();
        for _ in 0..5 {
            b.add_packet(Bytes::new(), now);
        }
        let acked = b.handle_ack(3, &[], now + Duration::from_millis(5));
        assert_eq!(acked, vec![0, 1, 2]);
        assert_eq!(b.send_base(), 3);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn sack_blocks_ack_out_of_order_without_advancing_base() {
        let mut b = buf();
        let now = Instant::now();
        for _ in 0..5 {
            b.add_packet(Bytes::new(), now);
        }
        let acked = b.handle_ack(0, &[SackBlock::new(2, 2)], now + Duration::from_millis(1));
        assert_eq!(acked, vec![2]);
        assert_eq!(b.send_base(), 0); // seq 0 still unacked, base can't advance
    }

    #[test]
    fn handle_ack_is_idempotent() {
        let mut b = buf();
        let now = Instant::now();
        b.add_packet(Bytes::new(), now);
        let first = b.handle_ack(5, &[], now);
        let second = b.handle_ack(5, &[], now);
        assert_eq!(first, vec![0]);
        assert!(second.is_empty());
    }

    #[test]
    fn update_rto_first_sample() {
        let mut b = buf();
        b.update_rto(Duration::from_millis(100));
        assert_eq!(b.srtt(), Some(Duration::from_millis(100)));
        assert_eq!(b.rttvar(), Duration::from_millis(50));
    }

    #[test]
    fn rto_stays_within_bounds() {
        let mut b = buf();
        b.update_rto(Duration::from_nanos(1));
        assert!(b.rto() >= MIN_RTO);
        b.update_rto(Duration::from_secs(1000));
        assert!(b.rto() <= MAX_RTO);
    }

    #[test]
    fn fast_retransmit_after_three_higher_acks() {
        let mut b = buf();
        let now = Instant::now();
        for _ in 0..10 {
            b.add_packet(Bytes::new(), now);
        }
        // seq 3 missing; acks for 4..10 arrive via SACK, cumulative ack stuck at 3.
        let blocks: Vec<SackBlock> = (4..10).map(|s| SackBlock::new(s, s)).collect();
        b.handle_ack(3, &blocks, now + Duration::from_millis(1));
        let (fast, timeout) = b.detect_lost(now + Duration::from_millis(2));
        assert_eq!(fast, vec![3]);
        assert!(timeout.is_empty());
        assert_eq!(b.fast_retrans_count(), 1);
    }

    #[test]
    fn timeout_retransmit_backs_off_exponentially() {
        let mut b = buf();
        let now = Instant::now();
        b.add_packet(Bytes::new(), now);
        let rto = b.rto();

        let (_, timeout) = b.detect_lost(now + rto + Duration::from_millis(1));
        assert_eq!(timeout, vec![0]);
        assert_eq!(b.record(0).unwrap().retransmit_count, 1);

        // Not yet at the new (now + 2*RTO) deadline: no second retransmit.
        let (_, timeout2) = b.detect_lost(now + rto + Duration::from_millis(2));
        assert!(timeout2.is_empty());

        let (_, timeout3) = b.detect_lost(now + 3 * rto + Duration::from_millis(50));
        assert_eq!(timeout3, vec![0]);
        assert_eq!(b.record(0).unwrap().retransmit_count, 2);
    }

    /// Literal numbers from the timeout-retransmit worked example: the
    /// first retransmit (at RTO elapsed) reschedules for firing-time +
    /// 2*RTO, the second (at ~3*RTO elapsed) reschedules for firing-time +
    /// 4*RTO.
    #[test]
    fn timeout_backoff_matches_worked_example() {
        let mut b = buf();
        let now = Instant::now();
        b.add_packet(Bytes::new(), now);
        let rto = b.rto();

        let fire1 = now + rto + Duration::from_millis(1);
        let (_, first) = b.detect_lost(fire1);
        assert_eq!(first, vec![0]);
        assert_eq!(b.record(0).unwrap().retransmit_count, 1);
        assert_eq!(b.record(0).unwrap().timeout_deadline, fire1 + 2 * rto);

        let (_, none_yet) = b.detect_lost(fire1 + 2 * rto - Duration::from_millis(1));
        assert!(none_yet.is_empty());

        let fire2 = fire1 + 2 * rto + Duration::from_millis(1);
        let (_, second) = b.detect_lost(fire2);
        assert_eq!(second, vec![0]);
        assert_eq!(b.record(0).unwrap().retransmit_count, 2);
        assert_eq!(b.record(0).unwrap().timeout_deadline, fire2 + 4 * rto);
    }

    #[test]
    fn already_acked_records_ignored_by_detect_lost() {
        let mut b = buf();
        let now = Instant::now();
        b.add_packet(Bytes::new(), now);
        b.handle_ack(1, &[], now);
        let (fast, timeout) = b.detect_lost(now + Duration::from_secs(120));
        assert!(fast.is_empty());
        assert!(timeout.is_empty());
    }
}
