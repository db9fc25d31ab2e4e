//! General-purpose BLAKE3 hashing.
//!
//! The DHT hashes node ids out of public keys, hashes values for
//! content-addressed ("hashable") keys, and verifies signed STOREs. BLAKE3
//! is used throughout rather than SHA-512 (which the original maidsafe-dht
//! used for its 512-bit keyspace) because it is the hash already in the
//! teacher stack; [`hash512`] extends it to 64 bytes via BLAKE3's XOF to keep
//! the same 512-bit node id width.

/// Compute the 256-bit BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Compute a 512-bit BLAKE3 hash via the extendable output function.
///
/// Used to derive node ids and DataStore keys in the full 512-bit keyspace
/// the routing table operates over.
pub fn hash512(data: &[u8]) -> [u8; 64] {
    let mut out = [0u8; 64];
    let mut hasher = ::blake3::Hasher::new();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    reader.fill(&mut out);
    out
}

/// Compute a variable-length BLAKE3 hash.
pub fn hash_xof(data: &[u8], output: &mut [u8]) {
    let mut hasher = ::blake3::Hasher::new();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    reader.fill(output);
}
