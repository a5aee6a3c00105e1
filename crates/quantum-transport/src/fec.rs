//! Forward error correction: a systematic MDS erasure code over
//! fixed-size, zero-padded shards, via `reed-solomon-simd`.
//!
//! The encoder accumulates data shards into the open group; once `K` have
//! arrived it seals the group and emits `M` parity shards computed over
//! the (zero-padded) data. The decoder accumulates shards per group by
//! index and, once `K` of the `K+M` have arrived, reconstructs all `K`
//! data shards and verifies the reconstruction by re-deriving parity and
//! comparing it against whatever parity shards were actually received.

use std::collections::{BTreeMap, HashMap};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

use crate::error::{FecError, ParseError};

/// Default shard size ceiling, matching the wire format's maximum payload.
pub const MSS: usize = crate::wire::MAX_PAYLOAD;

/// Encoded size of [`FecShardHeader`].
pub const FEC_HEADER_LEN: usize = 6;

/// Small fixed sub-header the connection layer prepends to the payload of
/// any packet with the wire header's FEC flag set, so the shard's group and
/// position survive a hop across the network without needing a dedicated
/// top-level wire field. Mirrors the donor codebase's pattern of parsing a
/// control-specific sub-header out of the payload once a flag identifies
/// the packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecShardHeader {
    pub group_id: u32,
    pub shard_index: u8,
    pub is_parity: bool,
}

impl FecShardHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.group_id);
        buf.put_u8(self.shard_index);
        buf.put_u8(self.is_parity as u8);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ParseError> {
        if buf.remaining() < FEC_HEADER_LEN {
            return Err(ParseError::ShortPacket);
        }
        let group_id = buf.get_u32();
        let shard_index = buf.get_u8();
        let is_parity = buf.get_u8() != 0;
        Ok(FecShardHeader { group_id, shard_index, is_parity })
    }
}

pub struct FecEncoder {
    k: usize,
    m: usize,
    next_group_id: u64,
    open_shards: Vec<Bytes>,
}

impl FecEncoder {
    pub fn new(k: usize, m: usize) -> Self {
        FecEncoder {
            k,
            m,
            next_group_id: 0,
            open_shards: Vec::with_capacity(k),
        }
    }

    /// Append a data unit to the currently-open group. Once `K` shards have
    /// accumulated, seals the group and returns `(group_id, parity_shards)`.
    pub fn add_data(&mut self, data: Bytes) -> (Option<u64>, Option<Vec<Bytes>>) {
        self.open_shards.push(data);
        if self.open_shards.len() < self.k {
            return (None, None);
        }

        let shard_len = self
            .open_shards
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(0)
            .max(1);
        let padded: Vec<Vec<u8>> = self
            .open_shards
            .iter()
            .map(|s| {
                let mut v = s.to_vec();
                v.resize(shard_len, 0);
                v
            })
            .collect();

        let group_id = self.next_group_id;
        self.next_group_id += 1;
        self.open_shards.clear();

        let parity = encode_parity(self.k, self.m, shard_len, &padded);
        (Some(group_id), Some(parity))
    }

    /// Discard the currently-open (unsealed) group.
    pub fn reset(&mut self) {
        self.open_shards.clear();
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn m(&self) -> usize {
        self.m
    }

    /// The group id that will be assigned when the currently-open group seals.
    pub fn current_group_id(&self) -> u64 {
        self.next_group_id
    }

    /// Number of data units accumulated into the currently-open group.
    pub fn open_len(&self) -> usize {
        self.open_shards.len()
    }
}

fn encode_parity(k: usize, m: usize, shard_len: usize, padded: &[Vec<u8>]) -> Vec<Bytes> {
    let mut encoder =
        ReedSolomonEncoder::new(k, m, shard_len).expect("valid (k, m, shard_len) parameters");
    for shard in padded {
        encoder
            .add_original_shard(shard)
            .expect("shard length matches the encoder's configured shard_len");
    }
    let result = encoder.encode().expect("encode with a full set of original shards");
    result
        .recovery_iter()
        .map(|shard| Bytes::copy_from_slice(shard))
        .collect()
}

struct DecodeGroup {
    shard_len: usize,
    data_shards: HashMap<u8, Bytes>,
    parity_shards: HashMap<u8, Bytes>,
    complete: bool,
}

pub struct FecDecoder {
    k: usize,
    m: usize,
    groups: BTreeMap<u64, DecodeGroup>,
}

impl FecDecoder {
    pub fn new(k: usize, m: usize) -> Self {
        FecDecoder {
            k,
            m,
            groups: BTreeMap::new(),
        }
    }

    /// Admit a shard. Returns the reconstructed `K` data shards once the
    /// group becomes recoverable; idempotent in `(group_id, shard_index)`.
    pub fn add_shard(
        &mut self,
        group_id: u64,
        shard_index: u8,
        data: Bytes,
        is_parity: bool,
    ) -> Result<Option<Vec<Bytes>>, FecError> {
        if is_parity {
            if shard_index as usize >= self.m {
                return Err(FecError::InvalidShardIndex(shard_index));
            }
        } else if shard_index as usize >= self.k {
            return Err(FecError::InvalidShardIndex(shard_index));
        }

        let k = self.k;
        let m = self.m;
        let group = self.groups.entry(group_id).or_insert_with(|| DecodeGroup {
            shard_len: data.len(),
            data_shards: HashMap::new(),
            parity_shards: HashMap::new(),
            complete: false,
        });

        if group.complete {
            return Ok(None);
        }

        group.shard_len = group.shard_len.max(data.len());

        if is_parity {
            group.parity_shards.entry(shard_index).or_insert(data);
        } else {
            group.data_shards.entry(shard_index).or_insert(data);
        }

        let received_count = group.data_shards.len() + group.parity_shards.len();
        if received_count < k {
            return Ok(None);
        }

        // Already have all K data shards with nothing missing — no need to
        // invoke the erasure-code math at all.
        if group.data_shards.len() == k {
            group.complete = true;
            let mut out = Vec::with_capacity(k);
            for idx in 0..k as u8 {
                out.push(group.data_shards.get(&idx).cloned().unwrap());
            }
            return Ok(Some(out));
        }

        let shard_len = group.shard_len;
        let mut decoder =
            ReedSolomonDecoder::new(k, m, shard_len).expect("valid (k, m, shard_len) parameters");
        for (&idx, shard) in &group.data_shards {
            decoder
                .add_original_shard(idx as usize, shard)
                .map_err(|_| FecError::ReconstructionFailed)?;
        }
        for (&idx, shard) in &group.parity_shards {
            decoder
                .add_recovery_shard(idx as usize, shard)
                .map_err(|_| FecError::ReconstructionFailed)?;
        }
        let result = decoder.decode().map_err(|_| FecError::ReconstructionFailed)?;

        let mut full_data: Vec<Bytes> = Vec::with_capacity(k);
        for idx in 0..k as u8 {
            if let Some(existing) = group.data_shards.get(&idx) {
                full_data.push(existing.clone());
            } else {
                let restored = result
                    .restored_original(idx as usize)
                    .ok_or(FecError::ReconstructionFailed)?;
                full_data.push(Bytes::copy_from_slice(restored));
            }
        }

        // Integrity check: re-derive parity from the full reconstructed set
        // and compare against whatever parity shards were actually received.
        let padded: Vec<Vec<u8>> = full_data.iter().map(|s| s.to_vec()).collect();
        let recomputed_parity = encode_parity(k, m, shard_len, &padded);
        for (&idx, received) in &group.parity_shards {
            if recomputed_parity.get(idx as usize) != Some(received) {
                return Err(FecError::ReconstructionFailed);
            }
        }

        group.complete = true;
        Ok(Some(full_data))
    }

    /// Retain only the `keep_latest` highest group ids, bounding memory
    /// against parity that never closes a group.
    pub fn cleanup_old_groups(&mut self, keep_latest: usize) {
        while self.groups.len() > keep_latest {
            let oldest = *self.groups.keys().next().expect("non-empty by loop guard");
            self.groups.remove(&oldest);
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
