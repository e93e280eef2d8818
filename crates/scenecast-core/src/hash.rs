//! Content hashes: identity and cache key of every resource.
//!
//! A resource's hash is BLAKE3 over its type tag, its type-specific metadata
//! and its decompressed payload. It is computed exactly once, when the
//! resource is created from raw data, and travels with the resource from then
//! on (resource files and resource streams carry it explicitly).

use std::fmt;

/// 32-byte BLAKE3 content hash of a resource.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourceContentHash(pub [u8; 32]);

impl ResourceContentHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex, as used in resource file tables of contents.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

/// Short form for logs: first 8 bytes in hex.
impl fmt::Display for ResourceContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for ResourceContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceContentHash({})", self)
    }
}

impl From<[u8; 32]> for ResourceContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for content that is assembled from pieces.
///
/// # Example
/// ```
/// use scenecast_core::hash::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize().0, scenecast_core::hash::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> ResourceContentHash {
        ResourceContentHash(*self.0.finalize().as_bytes())
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = ResourceContentHash(hash(b"vertex data"));
        let parsed = ResourceContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(parsed, h);
        assert!(ResourceContentHash::from_hex("abcd").is_none());
        assert!(ResourceContentHash::from_hex("not hex").is_none());
    }

    #[test]
    fn display_is_short_prefix() {
        let h = ResourceContentHash([0xab; 32]);
        assert_eq!(h.to_string(), "abababababababab");
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = Hasher::new();
        h.update(b"scene");
        h.update(b"cast");
        assert_eq!(h.finalize().0, hash(b"scenecast"));
    }
}
