//! QuickXOR content hash
//!
//! The remote identifies file content with a 160-bit QuickXOR digest. Each
//! input byte is XORed into a 160-bit accumulator at a bit position that
//! advances by 11 per byte, wrapping at 160; the little-endian total length
//! is XORed into the last 8 bytes of the final digest. Digests travel
//! base64-encoded.
//!
//! This is an independent in-tree implementation so that cached bodies can
//! be verified without network access.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Digest width in bits.
const WIDTH_BITS: usize = 160;

/// Digest width in bytes.
pub const WIDTH_BYTES: usize = WIDTH_BITS / 8;

/// Bit distance between the insertion points of consecutive input bytes.
const SHIFT: usize = 11;

/// Incremental QuickXOR hasher
///
/// ```
/// use cirrus_core::hash::QuickXorHash;
///
/// let mut h = QuickXorHash::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize_base64();
/// assert_eq!(digest, QuickXorHash::digest(b"hello world"));
/// ```
#[derive(Debug, Clone)]
pub struct QuickXorHash {
    /// 160-bit accumulator as little-endian bytes
    acc: [u8; WIDTH_BYTES],
    /// Insertion bit position for the next input byte
    bit_pos: usize,
    /// Total bytes consumed
    length: u64,
}

impl QuickXorHash {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            acc: [0u8; WIDTH_BYTES],
            bit_pos: 0,
            length: 0,
        }
    }

    /// Feeds bytes into the hash. May be called any number of times;
    /// chunking does not affect the digest.
    pub fn update(&mut self, data: &[u8]) {
        for &b in data {
            let idx = self.bit_pos / 8;
            let off = self.bit_pos % 8;
            let spread = (b as u16) << off;
            self.acc[idx] ^= spread as u8;
            let carry = (spread >> 8) as u8;
            if carry != 0 {
                // wraps from the last byte back to byte 0 at bit 160
                self.acc[(idx + 1) % WIDTH_BYTES] ^= carry;
            }
            self.bit_pos = (self.bit_pos + SHIFT) % WIDTH_BITS;
        }
        self.length += data.len() as u64;
    }

    /// Consumes the hasher and returns the 20-byte digest.
    pub fn finalize(self) -> [u8; WIDTH_BYTES] {
        let mut digest = self.acc;
        let length_bytes = self.length.to_le_bytes();
        for (i, lb) in length_bytes.iter().enumerate() {
            digest[WIDTH_BYTES - length_bytes.len() + i] ^= lb;
        }
        digest
    }

    /// Consumes the hasher and returns the base64 form used on the wire.
    pub fn finalize_base64(self) -> String {
        BASE64.encode(self.finalize())
    }

    /// One-shot convenience: the base64 digest of `data`.
    pub fn digest(data: &[u8]) -> String {
        let mut h = Self::new();
        h.update(data);
        h.finalize_base64()
    }
}

impl Default for QuickXorHash {
    fn default() -> Self {
        Self::new()
    }
}
