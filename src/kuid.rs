//! # 160-bit Identifiers and the XOR Metric
//!
//! Every node and every stored key lives in the same 160-bit address space.
//! Distance between two identifiers is their bitwise XOR interpreted as an
//! unsigned big-endian integer; "closer" always means a numerically smaller
//! XOR distance.
//!
//! [`Kuid`] is an immutable value type. All bit-level operations return new
//! values; nothing here carries state or can fail.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKey;

/// Identifier width in bits.
pub const KUID_BITS: usize = 160;

/// Identifier width in bytes.
pub const KUID_LEN: usize = KUID_BITS / 8;

/// A 160-bit identifier for a node or a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kuid([u8; KUID_LEN]);

impl Kuid {
    /// The all-zero identifier, also the distance from any id to itself.
    pub const MIN: Kuid = Kuid([0u8; KUID_LEN]);

    /// The all-ones identifier.
    pub const MAX: Kuid = Kuid([0xff; KUID_LEN]);

    #[inline]
    pub fn from_bytes(bytes: [u8; KUID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KUID_LEN] {
        &self.0
    }

    /// Derive an identifier from an Ed25519 public key by truncated blake3.
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = blake3::hash(key.as_bytes());
        let mut out = [0u8; KUID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..KUID_LEN]);
        Self(out)
    }

    /// Derive an identifier for a stored key from arbitrary bytes.
    pub fn from_content(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut out = [0u8; KUID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..KUID_LEN]);
        Self(out)
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; KUID_LEN];
        // getrandom failure only happens on broken platforms; fall back to
        // the thread RNG rather than panicking in a value type.
        if getrandom::getrandom(&mut bytes).is_err() {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut bytes);
        }
        Self(bytes)
    }

    /// A random identifier sharing the first `depth` bits with `prefix`.
    ///
    /// Used to aim bucket-refresh lookups into a specific keyspace region.
    pub fn random_within(prefix: Kuid, depth: usize) -> Self {
        let mut id = Self::random();
        for i in 0..depth.min(KUID_BITS) {
            if prefix.bit(i) {
                id = id.set_bit(i);
            } else {
                id = id.unset_bit(i);
            }
        }
        id
    }

    /// XOR distance to `other`. Symmetric; `self.xor(self)` is [`Kuid::MIN`].
    #[inline]
    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut out = [0u8; KUID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Kuid(out)
    }

    /// True if `a` is strictly nearer to `self` than `b`.
    ///
    /// Equal distances compare as "not nearer", so comparing an identifier
    /// against itself is a deterministic no-op.
    #[inline]
    pub fn is_nearer(&self, a: &Kuid, b: &Kuid) -> bool {
        self.xor(a) < self.xor(b)
    }

    /// Value of bit `i`, counting from the most significant bit.
    #[inline]
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < KUID_BITS);
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    #[inline]
    pub fn set_bit(&self, i: usize) -> Kuid {
        debug_assert!(i < KUID_BITS);
        let mut out = self.0;
        out[i / 8] |= 0x80 >> (i % 8);
        Kuid(out)
    }

    #[inline]
    pub fn unset_bit(&self, i: usize) -> Kuid {
        debug_assert!(i < KUID_BITS);
        let mut out = self.0;
        out[i / 8] &= !(0x80 >> (i % 8));
        Kuid(out)
    }

    #[inline]
    pub fn flip_bit(&self, i: usize) -> Kuid {
        debug_assert!(i < KUID_BITS);
        let mut out = self.0;
        out[i / 8] ^= 0x80 >> (i % 8);
        Kuid(out)
    }

    /// Number of leading bits shared with `other` (0..=160).
    pub fn common_prefix_len(&self, other: &Kuid) -> usize {
        for (byte_idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return byte_idx * 8 + diff.leading_zeros() as usize;
            }
        }
        KUID_BITS
    }

    /// True when every byte is zero.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != KUID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; KUID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Ord for Kuid {
    /// Unsigned big-endian ordering.
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Kuid {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kuid_with_first_byte(b: u8) -> Kuid {
        let mut bytes = [0u8; KUID_LEN];
        bytes[0] = b;
        Kuid::from_bytes(bytes)
    }

    #[test]
    fn xor_is_symmetric_and_self_distance_is_zero() {
        let a = Kuid::random();
        let b = Kuid::random();
        assert_eq!(a.xor(&b), b.xor(&a));
        assert_eq!(a.xor(&a), Kuid::MIN);
        assert!(a.xor(&a).is_zero());
    }

    #[test]
    fn nearer_is_strict() {
        let reference = kuid_with_first_byte(0x00);
        let near = kuid_with_first_byte(0x01);
        let far = kuid_with_first_byte(0xf0);
        assert!(reference.is_nearer(&near, &far));
        assert!(!reference.is_nearer(&far, &near));
        // equal distance is "not nearer"
        assert!(!reference.is_nearer(&near, &near));
        assert!(!reference.is_nearer(&reference, &reference));
    }

    #[test]
    fn bit_operations_round_trip() {
        let id = Kuid::MIN;
        for i in [0usize, 7, 8, 63, 159] {
            let set = id.set_bit(i);
            assert!(set.bit(i));
            assert_eq!(set.unset_bit(i), id);
            assert_eq!(set.flip_bit(i), id);
            assert_eq!(id.flip_bit(i), set);
        }
    }

    #[test]
    fn common_prefix_len_counts_leading_bits() {
        let a = Kuid::MIN;
        assert_eq!(a.common_prefix_len(&a), KUID_BITS);
        assert_eq!(a.common_prefix_len(&a.flip_bit(0)), 0);
        assert_eq!(a.common_prefix_len(&a.flip_bit(12)), 12);
        assert_eq!(a.common_prefix_len(&a.flip_bit(159)), 159);
    }

    #[test]
    fn random_within_respects_prefix() {
        let prefix = Kuid::random();
        for depth in [0usize, 1, 9, 64, 160] {
            let id = Kuid::random_within(prefix, depth);
            assert!(id.common_prefix_len(&prefix) >= depth.min(KUID_BITS));
        }
    }

    #[test]
    fn ordering_is_unsigned_big_endian() {
        assert!(kuid_with_first_byte(0x80) > kuid_with_first_byte(0x7f));
        assert!(Kuid::MIN < Kuid::MAX);
    }

    #[test]
    fn hex_round_trip() {
        let id = Kuid::random();
        assert_eq!(Kuid::from_hex(&id.to_hex()).unwrap(), id);
        assert!(Kuid::from_hex("abcd").is_err());
    }
}
