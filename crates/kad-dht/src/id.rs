//! 512-bit node identifier algebra.
//!
//! A [`NodeId`] is an opaque big-endian 512-bit unsigned integer. Bytes are
//! stored MSB-first, so lexicographic byte comparison is numeric comparison
//! and doubles as the ordering `impl`.

use std::cmp::Ordering;
use std::fmt;

use rand::RngCore;

use crate::{DhtError, Result};

/// Width of a node id in bytes (512 bits).
pub const ID_LEN: usize = 64;

/// An opaque 512-bit identifier. Immutable once constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// The all-zero id. Used as the client-mode sentinel.
    pub fn zero() -> Self {
        Self([0u8; ID_LEN])
    }

    /// The all-ones (maximum) id.
    pub fn max() -> Self {
        Self([0xFFu8; ID_LEN])
    }

    /// Generate a uniformly random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Construct an id from raw big-endian bytes.
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Return the raw big-endian bytes.
    pub fn to_bytes(&self) -> [u8; ID_LEN] {
        self.0
    }

    /// Parse an id from a 128-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let decoded = hex::decode(s)
            .map_err(|e| DhtError::InvalidArgument(format!("invalid hex id: {e}")))?;
        if decoded.len() != ID_LEN {
            return Err(DhtError::InvalidArgument(format!(
                "id must be {ID_LEN} bytes, got {}",
                decoded.len()
            )));
        }
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Format the id as a 128-character lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Derive an id from an arbitrary byte string via `kad_crypto::blake3::hash512`.
    pub fn derive(seed: &[u8]) -> Self {
        Self(kad_crypto::blake3::hash512(seed))
    }

    /// Construct `2^p`. Errors with `InvalidArgument` if `p` is not in `[0, 512)`.
    pub fn pow2(p: u32) -> Result<Self> {
        if p >= 512 {
            return Err(DhtError::InvalidArgument(format!(
                "power {p} out of range [0, 512)"
            )));
        }
        let mut bytes = [0u8; ID_LEN];
        let byte_index = ID_LEN - 1 - (p / 8) as usize;
        bytes[byte_index] = 1u8 << (p % 8);
        Ok(Self(bytes))
    }

    /// Construct `2^p - 1`, the maximum id representable in `p` bits.
    pub fn max_up_to_power(p: u32) -> Result<Self> {
        if p == 0 {
            return Ok(Self::zero());
        }
        if p > 512 {
            return Err(DhtError::InvalidArgument(format!(
                "power {p} out of range [0, 512]"
            )));
        }
        let mut bytes = [0u8; ID_LEN];
        let full_bytes = (p / 8) as usize;
        let rem_bits = p % 8;
        for b in bytes.iter_mut().skip(ID_LEN - full_bytes) {
            *b = 0xFF;
        }
        if rem_bits > 0 {
            bytes[ID_LEN - full_bytes - 1] = (1u8 << rem_bits) - 1;
        }
        Ok(Self(bytes))
    }

    /// XOR distance between two ids, itself a 512-bit value.
    pub fn distance(&self, other: &Self) -> Self {
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            out[i] = self.0[i] ^ other.0[i];
        }
        Self(out)
    }

    /// Return true iff `d(a, target) < d(b, target)`.
    pub fn closer_to(a: &Self, b: &Self, target: &Self) -> bool {
        a.distance(target) < b.distance(target)
    }

    /// Generate a uniformly distributed id in `[min, max]` (inclusive).
    ///
    /// Errors with `InvalidArgument` if `min > max`.
    pub fn random_in(min: &Self, max: &Self) -> Result<Self> {
        if min > max {
            return Err(DhtError::InvalidArgument(
                "random_in: min must not exceed max".to_string(),
            ));
        }
        if min == max {
            return Ok(*min);
        }

        // Rejection sampling over the byte-width of the range, masked to the
        // range's leading zero run so the acceptance rate stays high even
        // for narrow ranges deep in the keyspace.
        let span = max.distance(min);
        let leading_zero_bytes = span.0.iter().take_while(|&&b| b == 0).count();

        loop {
            let mut candidate = [0u8; ID_LEN];
            rand::thread_rng().fill_bytes(&mut candidate[leading_zero_bytes..]);
            let candidate = Self(candidate);
            // candidate is in [0, span]; offset by min to land in [min, max].
            if candidate <= span {
                let shifted = add_wrapping(&min.0, &candidate.0);
                let result = Self(shifted);
                if result >= *min && result <= *max {
                    return Ok(result);
                }
            }
        }
    }

    /// Split the closed range `[lo, hi]` at its midpoint, returning the two
    /// closed halves `[lo, mid]` and `[mid+1, hi]`.
    ///
    /// `mid = floor((lo + hi) / 2)`. Errors with `InvalidArgument` if `lo >= hi`.
    pub fn split_range(lo: &Self, hi: &Self) -> Result<((Self, Self), (Self, Self))> {
        if lo >= hi {
            return Err(DhtError::InvalidArgument(
                "split_range: lo must be strictly less than hi".to_string(),
            ));
        }
        let mid = midpoint(lo, hi);
        let mid_plus_one = increment(&mid);
        Ok(((*lo, mid), (mid_plus_one, *hi)))
    }
}

/// Compute `floor((lo + hi) / 2)` over the 512-bit unsigned range.
fn midpoint(lo: &NodeId, hi: &NodeId) -> NodeId {
    let mut sum = [0u16; ID_LEN];
    let mut carry = 0u16;
    for i in (0..ID_LEN).rev() {
        let s = lo.0[i] as u16 + hi.0[i] as u16 + carry;
        sum[i] = s & 0xFF;
        carry = s >> 8;
    }
    // sum now holds lo + hi as a 513-bit value (carry is the 513th bit).
    let mut result = [0u8; ID_LEN];
    let mut incoming = carry; // bit above the MSB, shifted in from the left
    for i in 0..ID_LEN {
        let combined = (incoming << 8) | sum[i];
        result[i] = (combined >> 1) as u8;
        incoming = combined & 1;
    }
    NodeId(result)
}

/// Compute `value + 1`, saturating at the all-ones value.
fn increment(value: &NodeId) -> NodeId {
    let mut out = value.0;
    for byte in out.iter_mut().rev() {
        if *byte == 0xFF {
            *byte = 0;
        } else {
            *byte += 1;
            return NodeId(out);
        }
    }
    NodeId::max()
}

/// Add two 512-bit values with wraparound (modulo 2^512).
fn add_wrapping(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let mut carry = 0u16;
    for i in (0..ID_LEN).rev() {
        let s = a[i] as u16 + b[i] as u16 + carry;
        out[i] = (s & 0xFF) as u8;
        carry = s >> 8;
    }
    out
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl serde::Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serde_bytes_array::serialize(&self.0, serializer)
    }
}

impl<'de> serde::Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = serde_bytes_array::deserialize(deserializer)?;
        Ok(Self(bytes))
    }
}

/// Serde support for fixed-size byte arrays (serde's blanket impl only
/// covers arrays up to 32 elements).
mod serde_bytes_array {
    use super::ID_LEN;
    use serde::de::Error;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; ID_LEN], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; ID_LEN], D::Error>
    where
        D: Deserializer<'de>,
    {
        let vec: Vec<u8> = serde::Deserialize::deserialize(deserializer)?;
        if vec.len() != ID_LEN {
            return Err(D::Error::custom(format!(
                "expected {ID_LEN} bytes, got {}",
                vec.len()
            )));
        }
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&vec);
        Ok(out)
    }
}
