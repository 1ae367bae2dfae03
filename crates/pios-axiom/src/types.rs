//! Common types for the Axiom layer.

/// Raw environment identifier (matches pios-kernel-core's `EnvId`)
pub type EnvRef = u64;

/// Node identifier within the cluster
pub type NodeRef = u16;

/// Event identifier (monotonic, unique within SysLog)
pub type EventId = u64;

/// Commit identifier (32-byte hash)
pub type CommitId = [u8; 32];

/// FNV-1a offset basis
pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;

/// FNV-1a prime
pub const FNV_PRIME: u64 = 0x100000001b3;

/// Incremental FNV-1a hasher.
///
/// Used for the commit hash chain and for address-space checksums; it needs
/// no allocation and is identical on every node.
#[derive(Clone, Copy, Debug)]
pub struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Self(FNV_OFFSET)
    }

    /// Mix a byte slice into the hash
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        for &byte in data {
            self.0 ^= byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn finish(&self) -> u64 {
        self.0
    }

    /// Expand the 64-bit state into a 32-byte commit id
    pub fn finish_wide(&self) -> CommitId {
        let mut result = [0u8; 32];
        let mut h = self.0;
        for chunk in result.chunks_mut(8) {
            chunk.copy_from_slice(&h.to_le_bytes());
            h = h.wrapping_mul(FNV_PRIME);
        }
        result
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_empty_is_offset_basis() {
        assert_eq!(Fnv1a::new().finish(), FNV_OFFSET);
    }

    #[test]
    fn test_fnv_known_vector() {
        // FNV-1a 64 of "a"
        assert_eq!(Fnv1a::new().bytes(b"a").finish(), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_fnv_order_sensitive() {
        let ab = Fnv1a::new().u8(1).u8(2).finish();
        let ba = Fnv1a::new().u8(2).u8(1).finish();
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_finish_wide_prefix_matches_state() {
        let h = *Fnv1a::new().u64(42);
        let wide = h.finish_wide();
        assert_eq!(&wide[..8], &h.finish().to_le_bytes());
    }
}
