// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use super::{FIL_COMMITMENT_UNSEALED, PieceCid, SHA2_256_TRUNC254_PADDED};
use crate::error::Error;
use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};

/// Bytes of raw payload per fr32 quad.
const QUAD_IN: usize = 127;
/// Bytes per quad after fr32 expansion: four 254-bit fields, each padded
/// to 256 bits.
const QUAD_OUT: usize = 128;
/// Merkle node width.
const NODE_SIZE: usize = 32;
/// Deepest tree supported: 2^50 leaves is far past the largest sector.
const MAX_LEVELS: usize = 50;

/// Streaming piece-commitment hasher.
///
/// Feed raw bytes with [`update`](Self::update) in chunks of any size;
/// [`finalize`](Self::finalize) zero-pads the final quad and the merkle
/// tree up to a power-of-two leaf count and returns the piece CID.
pub struct PieceHasher {
    /// Carry-over of a partial fr32 quad.
    pending: [u8; QUAD_IN],
    pending_len: usize,
    /// Stack of subtree roots, at most one per level.
    stack: Vec<(u32, [u8; NODE_SIZE])>,
    leaves: u64,
    raw_len: u64,
}

impl Default for PieceHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceHasher {
    pub fn new() -> Self {
        PieceHasher {
            pending: [0; QUAD_IN],
            pending_len: 0,
            stack: Vec::with_capacity(MAX_LEVELS),
            leaves: 0,
            raw_len: 0,
        }
    }

    /// Number of raw bytes consumed so far.
    pub fn bytes_written(&self) -> u64 {
        self.raw_len
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.raw_len += data.len() as u64;
        if self.pending_len > 0 {
            let take = data.len().min(QUAD_IN - self.pending_len);
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len == QUAD_IN {
                let quad = self.pending;
                self.pending_len = 0;
                self.absorb_quad(&quad);
            }
        }
        let mut chunks = data.chunks_exact(QUAD_IN);
        for chunk in &mut chunks {
            let mut quad = [0u8; QUAD_IN];
            quad.copy_from_slice(chunk);
            self.absorb_quad(&quad);
        }
        let rest = chunks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    /// Consume the hasher and produce the piece CID.
    pub fn finalize(mut self) -> Result<PieceCid, Error> {
        if self.raw_len == 0 {
            return Err(Error::InvalidPieceCid(
                "cannot hash an empty payload".into(),
            ));
        }
        if self.pending_len > 0 {
            // zero-fill the final partial quad
            let mut quad = [0u8; QUAD_IN];
            quad[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            self.pending_len = 0;
            self.absorb_quad(&quad);
        }

        let target_level = self
            .leaves
            .next_power_of_two()
            .trailing_zeros()
            .max(2); // minimum tree covers 128 padded bytes

        let zeros = zero_nodes(target_level as usize);
        loop {
            match self.stack.as_slice() {
                [(level, root)] if *level == target_level => {
                    let root = *root;
                    let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &root)
                        .expect("32-byte digest always wraps");
                    return PieceCid::from_cid(Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh));
                }
                [.., (level, _)] => {
                    let level = *level;
                    self.push(level, zeros[level as usize]);
                }
                [] => unreachable!("non-empty payload always yields leaves"),
            }
        }
    }

    fn absorb_quad(&mut self, quad: &[u8; QUAD_IN]) {
        let expanded = fr32_pad(quad);
        for leaf in expanded.chunks_exact(NODE_SIZE) {
            let mut node = [0u8; NODE_SIZE];
            node.copy_from_slice(leaf);
            self.leaves += 1;
            self.push(0, node);
        }
    }

    fn push(&mut self, level: u32, node: [u8; NODE_SIZE]) {
        let mut level = level;
        let mut node = node;
        while let Some((top_level, top)) = self.stack.last().copied() {
            if top_level != level {
                break;
            }
            self.stack.pop();
            node = hash_pair(&top, &node);
            level += 1;
        }
        self.stack.push((level, node));
    }
}

/// Combine two nodes: sha256(left ‖ right) truncated to 254 bits by
/// clearing the two most significant bits of the last byte.
pub(crate) fn hash_pair(left: &[u8; NODE_SIZE], right: &[u8; NODE_SIZE]) -> [u8; NODE_SIZE] {
    let mut sha = Sha256::new();
    sha.update(left);
    sha.update(right);
    let mut out = [0u8; NODE_SIZE];
    out.copy_from_slice(&sha.finalize());
    out[NODE_SIZE - 1] &= 0b0011_1111;
    out
}

fn zero_nodes(levels: usize) -> Vec<[u8; NODE_SIZE]> {
    let mut zeros = Vec::with_capacity(levels + 1);
    zeros.push([0u8; NODE_SIZE]);
    for i in 0..levels {
        let prev = zeros[i];
        zeros.push(hash_pair(&prev, &prev));
    }
    zeros
}

/// Expand one 127-byte quad into four 254-bit fields of 32 bytes each.
/// The bit stream is little-endian within bytes; every field gets two
/// zero bits of padding at its most significant end.
fn fr32_pad(input: &[u8; QUAD_IN]) -> [u8; QUAD_OUT] {
    let mut out = [0u8; QUAD_OUT];

    // field 0: bits 0..254
    out[..31].copy_from_slice(&input[..31]);
    out[31] = input[31] & 0x3f;

    // field 1: bits 254..508
    for j in 0..32 {
        out[32 + j] = (input[31 + j] >> 6) | (input[32 + j] << 2);
    }
    out[63] &= 0x3f;

    // field 2: bits 508..762
    for j in 0..32 {
        out[64 + j] = (input[63 + j] >> 4) | (input[64 + j] << 4);
    }
    out[95] &= 0x3f;

    // field 3: bits 762..1016
    for j in 0..31 {
        out[96 + j] = (input[95 + j] >> 2) | (input[96 + j] << 6);
    }
    out[127] = input[126] >> 2;

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn zero_quad_expands_to_zero_fields() {
        assert_eq!(fr32_pad(&[0u8; QUAD_IN]), [0u8; QUAD_OUT]);
    }

    #[test]
    fn fr32_fields_have_their_top_bits_clear() {
        let expanded = fr32_pad(&[0xff; QUAD_IN]);
        for field in expanded.chunks_exact(NODE_SIZE) {
            assert_eq!(field[NODE_SIZE - 1] & 0b1100_0000, 0);
        }
    }

    #[test]
    fn fr32_preserves_total_payload_bits() {
        // each field carries 254 payload bits; popcount must be conserved
        let mut input = [0u8; QUAD_IN];
        for (i, b) in input.iter_mut().enumerate() {
            *b = (i * 31) as u8;
        }
        let expanded = fr32_pad(&input);
        let in_bits: u32 = input.iter().map(|b| b.count_ones()).sum();
        let out_bits: u32 = expanded.iter().map(|b| b.count_ones()).sum();
        assert_eq!(in_bits, out_bits);
    }

    #[test]
    fn zero_piece_root_is_the_level_two_zero_node() {
        let piece = PieceCid::from_data(&[0u8; 127]).unwrap();
        let z0 = [0u8; NODE_SIZE];
        let z1 = hash_pair(&z0, &z0);
        let z2 = hash_pair(&z1, &z1);
        assert_eq!(piece.digest(), z2);
    }

    #[test]
    fn short_payload_is_zero_padded_to_a_full_quad() {
        // 127 zero bytes and 1 zero byte land on the same commitment
        let short = PieceCid::from_data(&[0u8; 1]).unwrap();
        let full = PieceCid::from_data(&[0u8; 127]).unwrap();
        assert_eq!(short, full);
    }

    #[test]
    fn tree_is_padded_to_a_power_of_two() {
        // 5 quads → 20 leaves → padded to 32; must differ from 8 quads
        // of the same prefix (32 leaves of real data)
        let five = PieceCid::from_data(&[0xab; 5 * QUAD_IN]).unwrap();
        let eight = PieceCid::from_data(&[0xab; 8 * QUAD_IN]).unwrap();
        assert_ne!(five, eight);
    }

    #[test]
    fn distinct_payloads_get_distinct_commitments() {
        let a = PieceCid::from_data(&[1u8; 256]).unwrap();
        let b = PieceCid::from_data(&[2u8; 256]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(PieceCid::from_data(&[]).is_err());
    }

    #[quickcheck]
    fn chunking_does_not_change_the_digest(data: Vec<u8>, splits: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        let one_shot = PieceCid::from_data(&data).unwrap();

        let mut hasher = PieceHasher::new();
        let mut rest = data.as_slice();
        for split in splits {
            if rest.is_empty() {
                break;
            }
            let take = (split as usize % 64 + 1).min(rest.len());
            hasher.update(&rest[..take]);
            rest = &rest[take..];
        }
        hasher.update(rest);
        assert_eq!(hasher.bytes_written(), data.len() as u64);
        hasher.finalize().unwrap() == one_shot
    }
}
