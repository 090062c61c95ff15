// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Piece commitments: content-addressed identifiers for uploaded bytes.
//!
//! A piece CID is a v1 CID with the `fil-commitment-unsealed` codec whose
//! multihash is the root of a truncated-sha256 binary merkle tree over the
//! fr32-padded payload.

mod hasher;
mod stream;

pub use hasher::PieceHasher;
pub use stream::collect_validated;

use crate::error::Error;
use cid::Cid;
use std::fmt;
use std::str::FromStr;

/// Multicodec for unsealed Filecoin commitments.
pub const FIL_COMMITMENT_UNSEALED: u64 = 0xf101;
/// Multihash code for sha2-256 truncated to 254 bits with fr32 padding.
pub const SHA2_256_TRUNC254_PADDED: u64 = 0x1012;

/// A validated piece CID. Construction guarantees the codec, multihash
/// code and digest length, so downstream code never re-checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceCid(Cid);

impl PieceCid {
    pub fn from_cid(cid: Cid) -> Result<Self, Error> {
        if cid.codec() != FIL_COMMITMENT_UNSEALED {
            return Err(Error::InvalidPieceCid(format!(
                "codec {:#x} is not fil-commitment-unsealed",
                cid.codec()
            )));
        }
        let hash = cid.hash();
        if hash.code() != SHA2_256_TRUNC254_PADDED {
            return Err(Error::InvalidPieceCid(format!(
                "multihash code {:#x} is not sha2-256-trunc254-padded",
                hash.code()
            )));
        }
        if hash.digest().len() != 32 {
            return Err(Error::InvalidPieceCid(format!(
                "digest is {} bytes, expected 32",
                hash.digest().len()
            )));
        }
        Ok(PieceCid(cid))
    }

    /// Compute the piece CID of a byte buffer in one shot.
    pub fn from_data(data: &[u8]) -> Result<Self, Error> {
        let mut hasher = PieceHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn cid(&self) -> &Cid {
        &self.0
    }

    /// The raw 32-byte commitment digest.
    pub fn digest(&self) -> &[u8] {
        self.0.hash().digest()
    }
}

impl fmt::Display for PieceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PieceCid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let cid = Cid::from_str(s).map_err(|e| Error::InvalidPieceCid(e.to_string()))?;
        Self::from_cid(cid)
    }
}

impl serde::Serialize for PieceCid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PieceCid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cid::Cid;
    use multihash::Multihash;

    #[test]
    fn display_round_trips_through_from_str() {
        let piece = PieceCid::from_data(&[0u8; 127]).unwrap();
        let parsed: PieceCid = piece.to_string().parse().unwrap();
        assert_eq!(piece, parsed);
        // piece CIDs are base32 v1 CIDs with the baga prefix
        assert!(piece.to_string().starts_with("baga"));
    }

    #[test]
    fn wrong_codec_is_rejected() {
        let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &[0u8; 32]).unwrap();
        let cid = Cid::new_v1(0x55, mh); // raw codec
        assert!(matches!(
            PieceCid::from_cid(cid),
            Err(Error::InvalidPieceCid(_))
        ));
    }

    #[test]
    fn wrong_multihash_is_rejected() {
        let mh = Multihash::wrap(0x12, &[0u8; 32]).unwrap(); // plain sha2-256
        let cid = Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh);
        assert!(matches!(
            PieceCid::from_cid(cid),
            Err(Error::InvalidPieceCid(_))
        ));
    }

    #[test]
    fn short_digest_is_rejected() {
        let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, &[0u8; 16]).unwrap();
        let cid = Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh);
        assert!(matches!(
            PieceCid::from_cid(cid),
            Err(Error::InvalidPieceCid(_))
        ));
    }
}
