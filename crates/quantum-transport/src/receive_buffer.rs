//! Per-connection receive buffer: reordering, duplicate suppression, and
//! cumulative ACK + SACK generation.
//!
//! `out_of_order` is a `BTreeMap` keyed by sequence number, mirroring the
//! send buffer's container choice, with the same RFC 1982 wraparound-safe
//! comparisons.

use std::collections::BTreeMap;

use crate::wire::{seq_gt, seq_lt, SackBlock};

/// Maximum SACK blocks reported per [`ReceiveBuffer::generate_sack`] call.
const MAX_SACK_BLOCKS: usize = 8;

#[derive(Debug, Clone)]
pub struct ReceivedRecord {
    pub seq: u32,
    pub payload: bytes::Bytes,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Ok,
    Duplicate,
    BufferOverflow,
}

pub struct ReceiveBuffer {
    out_of_order: BTreeMap<u32, ReceivedRecord>,
    next_expected: u32,
    window_packets: u32,
    duplicate_count: u64,
    overflow_count: u64,
}

impl ReceiveBuffer {
    pub fn new(window_packets: u32) -> Self {
        ReceiveBuffer {
            out_of_order: BTreeMap::new(),
            next_expected: 0,
            window_packets,
            duplicate_count: 0,
            overflow_count: 0,
        }
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_count
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn buffered_len(&self) -> usize {
        self.out_of_order.len()
    }

    /// Admit a packet. Returns the contiguous run of now-deliverable
    /// payloads (in order), whether the packet was a duplicate, and
    /// whether it overflowed the receive window.
    pub fn add_packet(&mut self, seq: u32, payload: bytes::Bytes) -> (Vec<ReceivedRecord>, AddOutcome) {
        if seq_lt(seq, self.next_expected) || self.out_of_order.contains_key(&seq) {
            self.duplicate_count += 1;
            return (Vec::new(), AddOutcome::Duplicate);
        }

        let offset = seq.wrapping_sub(self.next_expected);
        if offset >= self.window_packets {
            self.overflow_count += 1;
            return (Vec::new(), AddOutcome::BufferOverflow);
        }

        self.out_of_order.insert(seq, ReceivedRecord { seq, payload });

        let mut delivered = Vec::new();
        if seq == self.next_expected {
            while let Some(record) = self.out_of_order.remove(&self.next_expected) {
                self.next_expected = self.next_expected.wrapping_add(1);
                delivered.push(record);
            }
        }

        (delivered, AddOutcome::Ok)
    }

    /// Up to 8 maximal contiguous ranges present in `out_of_order`, in
    /// largest-first-seq order (so the most recent ranges survive
    /// truncation), with adjacent ranges coalesced.
    pub fn generate_sack(&self) -> (u32, Vec<SackBlock>) {
        let mut ranges: Vec<SackBlock> = Vec::new();
        let mut iter = self.out_of_order.keys().copied().peekable();

        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next == end.wrapping_add(1) {
                    end = next;
                    iter.next();
                } else {
                    break;
                }
            }
            ranges.push(SackBlock::new(start, end));
        }

        // Largest-first-seq ordering.
        ranges.sort_by(|a, b| {
            if a.start == b.start {
                std::cmp::Ordering::Equal
            } else if seq_gt(a.start, b.start) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        ranges.truncate(MAX_SACK_BLOCKS);

        (self.next_expected, ranges)
    }

    /// True if `seq` is already covered by an existing SACK range or has
    /// already been delivered — i.e. a future arrival of this sequence
    /// number should be treated as a duplicate.
    pub fn is_covered(&self, seq: u32) -> bool {
        seq_lt(seq, self.next_expected) || self.out_of_order.contains_key(&seq)
    }
}
