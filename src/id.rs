use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
    str::FromStr,
};
use thiserror::Error;

/// Length of a SHA-1 hash.
pub const SHA_HASH_LEN: usize = 20;

/// Number of bits in an id, which is also the number of routing table buckets.
pub const ID_BITS: usize = SHA_HASH_LEN * 8;

/// SHA-1 hash wrapper type for performing operations on the hash.
///
/// Ids are plain values: every operation returns a new hash and leaves the receiver untouched.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShaHash(#[serde(with = "byte_array")] [u8; SHA_HASH_LEN]);

impl ShaHash {
    /// Create a ShaHash by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// XOR distance between two ids.
    pub fn distance(&self, other: &Self) -> Self {
        *self ^ *other
    }

    /// `floor(log2(self ^ other))`, or `-1` when both ids are equal.
    pub fn log_distance(&self, other: &Self) -> i32 {
        let zeros = self.distance(other).leading_zeros() as i32;
        ID_BITS as i32 - 1 - zeros
    }

    /// Random id whose log-distance from `self` is exactly `log_distance`.
    ///
    /// Panics if `log_distance >= ID_BITS`.
    pub fn random_at_log_distance<R: Rng + ?Sized>(&self, log_distance: usize, rng: &mut R) -> Self {
        assert!(log_distance < ID_BITS, "log distance out of range");

        // Index of the first differing bit, counted from the most significant one.
        let pivot = ID_BITS - 1 - log_distance;
        let random: [u8; SHA_HASH_LEN] = rng.gen();
        let mut bytes = self.0;

        for index in pivot..ID_BITS {
            let (byte_index, shift) = (index / 8, 7 - index % 8);
            let mask = 1u8 << shift;

            if index == pivot {
                bytes[byte_index] ^= mask;
            } else {
                bytes[byte_index] = (bytes[byte_index] & !mask) | (random[byte_index] & mask);
            }
        }

        Self(bytes)
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<ShaHash> for [u8; SHA_HASH_LEN] {
    fn from(hash: ShaHash) -> [u8; SHA_HASH_LEN] {
        hash.0
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        Self(hash)
    }
}

/// Failure to build an id from external input.
#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("invalid id length: expected {} bytes, got {0}", SHA_HASH_LEN)]
    Length(usize),
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),
}

impl<'a> TryFrom<&'a [u8]> for ShaHash {
    type Error = IdError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(
            slice
                .try_into()
                .map_err(|_| IdError::Length(slice.len()))?,
        ))
    }
}

impl FromStr for ShaHash {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice())
    }
}

impl BitXor for ShaHash {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<ShaHash> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ShaHash {
        ShaHash(rng.gen())
    }
}

impl fmt::LowerHex for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

impl fmt::Display for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod byte_array {
    use super::SHA_HASH_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8; SHA_HASH_LEN],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; SHA_HASH_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", SHA_HASH_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}

// ----------------------------------------------------------------------------//

/// Bittorrent `NodeId`.
pub type NodeId = ShaHash;

/// Bittorrent `InfoHash`.
pub type InfoHash = ShaHash;

/// Length of a `NodeId`.
pub const NODE_ID_LEN: usize = SHA_HASH_LEN;

/// Length of an `InfoHash`.
pub const INFO_HASH_LEN: usize = SHA_HASH_LEN;

// ----------------------------------------------------------------------------//
