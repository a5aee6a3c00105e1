//! Wire header codec.
//!
//! Fixed, big-endian packet header plus zero to eight SACK blocks:
//!
//! ```text
//! offset size  field
//!   0    4     magic          (= 0x5155_4E54)
//!   4    1     version        (= 1)
//!   5    1     flags          bit 0=SYN, 1=ACK, 2=FIN, 3=RST,
//!                             bit 4=FEC, 5=PSH, 6=URG, 7=ECE
//!   6   16     connection_id  (128-bit)
//!  22    4     sequence_number
//!  26    4     ack_number
//!  30    2     payload_length
//!  32   0..64  sack_blocks    N x (start:4, end:4), N in [0,8]
//!   ...        payload        payload_length bytes
//! ```
//!
//! Header minimum 32 bytes, 96 bytes with a full SACK complement, maximum
//! payload 1400 bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ParseError, ValidationError};

pub const MAGIC: u32 = 0x5155_4E54;
pub const VERSION: u8 = 1;
pub const MAX_PAYLOAD: usize = 1400;
pub const MAX_SACK_BLOCKS: usize = 8;
pub const MIN_HEADER_LEN: usize = 32;
pub const SACK_BLOCK_LEN: usize = 8;
pub const MAX_HEADER_LEN: usize = MIN_HEADER_LEN + MAX_SACK_BLOCKS * SACK_BLOCK_LEN;

/// Header flag bits. Stored as a plain `u8` bitset, matching the single
/// flags byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(pub u8);

impl Flags {
    pub const SYN: u8 = 1 << 0;
    pub const ACK: u8 = 1 << 1;
    pub const FIN: u8 = 1 << 2;
    pub const RST: u8 = 1 << 3;
    pub const FEC: u8 = 1 << 4;
    pub const PSH: u8 = 1 << 5;
    pub const URG: u8 = 1 << 6;
    pub const ECE: u8 = 1 << 7;

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn new(bits: u8) -> Self {
        Flags(bits)
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_syn(self) -> bool {
        self.has(Self::SYN)
    }
    pub fn is_ack(self) -> bool {
        self.has(Self::ACK)
    }
    pub fn is_fin(self) -> bool {
        self.has(Self::FIN)
    }
    pub fn is_rst(self) -> bool {
        self.has(Self::RST)
    }
    pub fn is_fec(self) -> bool {
        self.has(Self::FEC)
    }
}

/// An inclusive `[start, end]` selective-acknowledgment range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u32,
    pub end: u32,
}

impl SackBlock {
    pub fn new(start: u32, end: u32) -> Self {
        SackBlock { start, end }
    }

    pub fn contains(self, seq: u32) -> bool {
        seq_geq(seq, self.start) && seq_leq(seq, self.end)
    }
}

/// Packet header. `connection_id` is the connection's 128-bit identifier
/// (see [`crate::connection::ConnectionId`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: Flags,
    pub connection_id: u128,
    pub sequence_number: u32,
    pub ack_number: u32,
    pub payload_length: u16,
    pub sack_blocks: Vec<SackBlock>,
}

impl Header {
    pub fn new(connection_id: u128, sequence_number: u32, ack_number: u32) -> Self {
        Header {
            flags: Flags::empty(),
            connection_id,
            sequence_number,
            ack_number,
            payload_length: 0,
            sack_blocks: Vec::new(),
        }
    }

    pub fn header_len(&self) -> usize {
        MIN_HEADER_LEN + self.sack_blocks.len() * SACK_BLOCK_LEN
    }

    /// Re-checks field bounds and SACK ordering. Must pass before `encode`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.payload_length as usize > MAX_PAYLOAD {
            return Err(ValidationError::OversizedPayload);
        }
        if self.sack_blocks.len() > MAX_SACK_BLOCKS {
            return Err(ValidationError::SackOverflow);
        }
        for block in &self.sack_blocks {
            if block.start > block.end {
                return Err(ValidationError::BadSackOrder);
            }
        }
        if self.connection_id == 0 {
            return Err(ValidationError::ZeroConnectionId);
        }
        Ok(())
    }

    /// Encode the header (without payload) into `buf`. Caller must append
    /// the payload bytes separately. Requires a prior successful
    /// [`Header::validate`].
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.flags.0);
        buf.put_u128(self.connection_id);
        buf.put_u32(self.sequence_number);
        buf.put_u32(self.ack_number);
        buf.put_u16(self.payload_length);
        for block in &self.sack_blocks {
            buf.put_u32(block.start);
            buf.put_u32(block.end);
        }
    }

    /// Decode a header from the front of `buf`. Does not consume the
    /// trailing payload bytes; the caller slices those off using
    /// `payload_length` after a successful decode.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, ParseError> {
        if buf.remaining() < MIN_HEADER_LEN {
            return Err(ParseError::ShortPacket);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(ParseError::InvalidMagic);
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(ParseError::UnsupportedVersion);
        }
        let flags = Flags(buf.get_u8());
        let connection_id = buf.get_u128();
        let sequence_number = buf.get_u32();
        let ack_number = buf.get_u32();
        let payload_length = buf.get_u16();
        if payload_length as usize > MAX_PAYLOAD {
            return Err(ParseError::OversizedPayload);
        }

        // Whatever remains, minus the payload itself, must be a whole
        // number of 8-byte SACK blocks, and no more than 8 of them.
        let remaining_after_payload = buf
            .remaining()
            .checked_sub(payload_length as usize)
            .ok_or(ParseError::ShortPacket)?;
        if remaining_after_payload % SACK_BLOCK_LEN != 0 {
            return Err(ParseError::BadSACK);
        }
        let sack_count = remaining_after_payload / SACK_BLOCK_LEN;
        if sack_count > MAX_SACK_BLOCKS {
            return Err(ParseError::BadSACK);
        }

        let mut sack_blocks = Vec::with_capacity(sack_count);
        for _ in 0..sack_count {
            let start = buf.get_u32();
            let end = buf.get_u32();
            sack_blocks.push(SackBlock::new(start, end));
        }

        Ok(Header {
            flags,
            connection_id,
            sequence_number,
            ack_number,
            payload_length,
            sack_blocks,
        })
    }
}

/// A full packet: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(mut header: Header, payload: Bytes) -> Self {
        header.payload_length = payload.len() as u16;
        Packet { header, payload }
    }

    pub fn encode(&self) -> Result<Bytes, ValidationError> {
        let mut buf = BytesMut::with_capacity(self.header.header_len() + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// As [`Packet::encode`], but writes into a caller-supplied buffer
    /// instead of allocating one. Lets a hot-path caller reuse pooled
    /// capacity across packets.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ValidationError> {
        self.header.validate()?;
        self.header.encode(buf);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, ParseError> {
        let header = Header::decode(&mut raw)?;
        let payload_len = header.payload_length as usize;
        if raw.remaining() < payload_len {
            return Err(ParseError::ShortPacket);
        }
        let payload = raw.copy_to_bytes(payload_len);
        Ok(Packet { header, payload })
    }
}

/// RFC 1982 serial-number comparison for wrapping 32-bit sequence numbers:
/// `a > b` in the modular sense.
pub fn seq_gt(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b) as i32;
    diff > 0
}

pub fn seq_geq(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

pub fn seq_lt(a: u32, b: u32) -> bool {
    seq_gt(b, a)
}

pub fn seq_leq(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> Header {
        let mut h = Header::new(0xABCD_EF01_2345_6789_ABCD_EF01_2345_6789, 42, 7);
        h.flags.set(Flags::ACK);
        h.sack_blocks.push(SackBlock::new(10, 20));
        h.sack_blocks.push(SackBlock::new(30, 30));
        h
    }

    #[test]
    fn header_roundtrip() {
        let h = sample_header();
        let packet = Packet::new(h.clone(), Bytes::from_static(b"hello"));
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded.header, Packet::new(h, Bytes::from_static(b"hello")).header);
        assert_eq!(decoded.payload, &b"hello"[..]);
    }

    #[test]
    fn zero_payload_is_valid() {
        let h = Header::new(1, 0, 0);
        let packet = Packet::new(h, Bytes::new());
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), MIN_HEADER_LEN);
        let decoded = Packet::decode(encoded).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn max_payload_is_valid() {
        let h = Header::new(1, 0, 0);
        let payload = Bytes::from(vec![0xAB; MAX_PAYLOAD]);
        let packet = Packet::new(h, payload.clone());
        let encoded = packet.encode().unwrap();
        let decoded = Packet::decode(encoded).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn oversized_payload_rejected_by_validate() {
        let mut h = Header::new(1, 0, 0);
        h.payload_length = (MAX_PAYLOAD + 1) as u16;
        assert_eq!(h.validate(), Err(ValidationError::OversizedPayload));
    }

    #[test]
    fn nine_sack_blocks_rejected_by_validate() {
        let mut h = Header::new(1, 0, 0);
        for i in 0..9u32 {
            h.sack_blocks.push(SackBlock::new(i, i));
        }
        assert_eq!(h.validate(), Err(ValidationError::SackOverflow));
    }

    #[test]
    fn bad_sack_order_rejected() {
        let mut h = Header::new(1, 0, 0);
        h.sack_blocks.push(SackBlock::new(5, 1));
        assert_eq!(h.validate(), Err(ValidationError::BadSackOrder));
    }

    #[test]
    fn zero_connection_id_rejected() {
        let h = Header::new(0, 0, 0);
        assert_eq!(h.validate(), Err(ValidationError::ZeroConnectionId));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xDEAD_BEEF);
        buf.put_bytes(0, MIN_HEADER_LEN - 4);
        assert_eq!(Header::decode(&mut buf.freeze()), Err(ParseError::InvalidMagic));
    }

    #[test]
    fn decode_rejects_short_packet() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u8(VERSION);
        assert_eq!(Header::decode(&mut buf.freeze()), Err(ParseError::ShortPacket));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAGIC);
        buf.put_u8(2);
        buf.put_bytes(0, MIN_HEADER_LEN - 5);
        assert_eq!(
            Header::decode(&mut buf.freeze()),
            Err(ParseError::UnsupportedVersion)
        );
    }

    #[test]
    fn decode_rejects_bad_sack_remainder() {
        let h = Header::new(1, 0, 0);
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf.put_bytes(0, 3); // not a multiple of 8
        assert_eq!(Header::decode(&mut buf.freeze()), Err(ParseError::BadSACK));
    }

    #[test]
    fn decode_rejects_too_many_sack_blocks() {
        let h = Header::new(1, 0, 0);
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        buf.put_bytes(0, SACK_BLOCK_LEN * 9);
        assert_eq!(Header::decode(&mut buf.freeze()), Err(ParseError::BadSACK));
    }

    #[test]
    fn sequence_wraparound_ordering() {
        assert!(seq_gt(1, 0));
        assert!(seq_gt(0, u32::MAX));
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_geq(5, 5));
        assert!(seq_leq(5, 5));
        assert!(!seq_gt(5, 5));
    }

    #[test]
    fn sack_block_contains_handles_wraparound() {
        let block = SackBlock::new(u32::MAX - 1, 1);
        assert!(block.contains(u32::MAX));
        assert!(block.contains(0));
        assert!(block.contains(1));
        assert!(!block.contains(2));
    }

    proptest! {
        #[test]
        fn header_roundtrip_prop(
            connection_id in 1u128..,
            seq in any::<u32>(),
            ack in any::<u32>(),
            payload_len in 0usize..=MAX_PAYLOAD,
            n_blocks in 0usize..=MAX_SACK_BLOCKS,
        ) {
            let mut h = Header::new(connection_id, seq, ack);
            let mut prev_end = 0u32;
            for i in 0..n_blocks as u32 {
                let start = prev_end + i * 2;
                let end = start + 1;
                h.sack_blocks.push(SackBlock::new(start, end));
                prev_end = end + 1;
            }
            let payload = Bytes::from(vec![0x42u8; payload_len]);
            let packet = Packet::new(h, payload.clone());
            let encoded = packet.encode().unwrap();
            let decoded = Packet::decode(encoded).unwrap();
            prop_assert_eq!(decoded.header, packet.header);
            prop_assert_eq!(decoded.payload, payload);
        }
    }
}
