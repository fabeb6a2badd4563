//! Key encoding for storage operations
//!
//! Record keys are `prefix | cluster | position`, big-endian, so a prefix
//! scan over one cluster yields positions in ascending order.

use tessera_core::{ClusterId, Rid};

/// Prefix bytes for different key types
pub mod prefix {
    pub const RECORD: u8 = 0x01;
    pub const CLUSTER: u8 = 0x02;
    pub const META: u8 = 0x08;
}

/// Key builder for storage operations
#[derive(Debug)]
pub struct KeyBuilder {
    buffer: Vec<u8>,
}

impl KeyBuilder {
    /// Create a new key builder with estimated capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Key of a stored record
    pub fn record(rid: Rid) -> Vec<u8> {
        let mut builder = Self::new(13);
        builder.push_u8(prefix::RECORD);
        builder.push_i32(rid.cluster());
        builder.push_i64(rid.position());
        builder.finish()
    }

    /// Prefix for scanning every record of a cluster
    pub fn record_prefix(cluster: ClusterId) -> Vec<u8> {
        let mut builder = Self::new(5);
        builder.push_u8(prefix::RECORD);
        builder.push_i32(cluster);
        builder.finish()
    }

    /// Key of a cluster definition
    pub fn cluster(cluster: ClusterId) -> Vec<u8> {
        let mut builder = Self::new(5);
        builder.push_u8(prefix::CLUSTER);
        builder.push_i32(cluster);
        builder.finish()
    }

    /// Prefix for scanning all cluster definitions
    pub fn cluster_prefix() -> Vec<u8> {
        vec![prefix::CLUSTER]
    }

    /// Create a metadata key
    pub fn meta(key: &str) -> Vec<u8> {
        let mut builder = Self::new(3 + key.len());
        builder.push_u8(prefix::META);
        builder.push_string(key);
        builder.finish()
    }

    // Builder methods

    fn push_u8(&mut self, val: u8) {
        self.buffer.push(val);
    }

    // Sign bit flipped so negative values sort before positive ones
    fn push_i32(&mut self, val: i32) {
        self.buffer
            .extend_from_slice(&((val as u32) ^ 0x8000_0000).to_be_bytes());
    }

    fn push_i64(&mut self, val: i64) {
        self.buffer
            .extend_from_slice(&((val as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
    }

    fn push_string(&mut self, s: &str) {
        // Length-prefixed string
        let bytes = s.as_bytes();
        self.buffer
            .extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.buffer.extend_from_slice(bytes);
    }

    fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Key decoder for parsing stored keys
pub struct KeyDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> KeyDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let val = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(val)
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        let bytes: [u8; 4] = self.data.get(self.pos..self.pos + 4)?.try_into().ok()?;
        self.pos += 4;
        Some((u32::from_be_bytes(bytes) ^ 0x8000_0000) as i32)
    }

    pub fn read_i64(&mut self) -> Option<i64> {
        let bytes: [u8; 8] = self.data.get(self.pos..self.pos + 8)?.try_into().ok()?;
        self.pos += 8;
        Some((u64::from_be_bytes(bytes) ^ 0x8000_0000_0000_0000) as i64)
    }

    /// Decode a full record key back into its rid
    pub fn read_rid(&mut self) -> Option<Rid> {
        if self.read_u8()? != prefix::RECORD {
            return None;
        }
        let cluster = self.read_i32()?;
        let position = self.read_i64()?;
        Some(Rid::new(cluster, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_key() {
        let key = KeyBuilder::record(Rid::new(12, 42));
        assert_eq!(key[0], prefix::RECORD);
        assert_eq!(key.len(), 13);

        let mut decoder = KeyDecoder::new(&key);
        assert_eq!(decoder.read_rid(), Some(Rid::new(12, 42)));
    }

    #[test]
    fn test_record_keys_sort_by_position() {
        let a = KeyBuilder::record(Rid::new(3, 2));
        let b = KeyBuilder::record(Rid::new(3, 10));
        let c = KeyBuilder::record(Rid::new(4, 0));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_key_prefix_scanning() {
        let prefix = KeyBuilder::record_prefix(7);
        assert!(KeyBuilder::record(Rid::new(7, 99)).starts_with(&prefix));
        assert!(!KeyBuilder::record(Rid::new(8, 0)).starts_with(&prefix));
    }

    #[test]
    fn test_negative_values_sort_first() {
        let neg = KeyBuilder::record(Rid::new(-1, 0));
        let pos = KeyBuilder::record(Rid::new(0, 0));
        assert!(neg < pos);
        let mut decoder = KeyDecoder::new(&neg);
        assert_eq!(decoder.read_rid(), Some(Rid::new(-1, 0)));
    }

    proptest! {
        #[test]
        fn prop_key_order_matches_rid_order(
            c1 in -50i32..50, p1 in any::<i64>(),
            c2 in -50i32..50, p2 in any::<i64>(),
        ) {
            let (a, b) = (Rid::new(c1, p1), Rid::new(c2, p2));
            prop_assert_eq!(KeyBuilder::record(a).cmp(&KeyBuilder::record(b)), a.cmp(&b));
            prop_assert_eq!(KeyDecoder::new(&KeyBuilder::record(a)).read_rid(), Some(a));
        }
    }
}
