//! Opaque cache values and keys.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Type tag for plain binary values.
pub const TYPE_TAG_BINARY: u8 = 0;

/// An opaque cache value: serialized payload plus a type tag.
///
/// The engine never interprets the payload; the tag lets upper layers route
/// deserialization and lets the engine report unregistered types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheValue {
    data: Bytes,
    type_tag: u8,
}

impl CacheValue {
    /// Create a plain binary value.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            type_tag: TYPE_TAG_BINARY,
        }
    }

    /// Create a value with an explicit type tag.
    pub fn with_type_tag(data: impl Into<Bytes>, type_tag: u8) -> Self {
        Self {
            data: data.into(),
            type_tag,
        }
    }

    /// The serialized payload.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The type tag.
    pub fn type_tag(&self) -> u8 {
        self.type_tag
    }
}

impl From<&[u8]> for CacheValue {
    fn from(data: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(data: Vec<u8>) -> Self {
        Self::new(Bytes::from(data))
    }
}

/// An entry key: opaque bytes plus the owning partition.
///
/// Equality is by logical value (the bytes); the partition is routing
/// metadata derived from the key. The hash is computed once at construction.
#[derive(Debug, Clone)]
pub struct EntryKey {
    bytes: Bytes,
    partition: u32,
    hash: u64,
}

impl EntryKey {
    /// Create a key for the given partition.
    pub fn new(bytes: impl Into<Bytes>, partition: u32) -> Self {
        let bytes = bytes.into();
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&bytes);
        let hash = hasher.finish();
        Self {
            bytes,
            partition,
            hash,
        }
    }

    /// The key bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// The owning partition.
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// The cached key hash.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for EntryKey {}

impl std::hash::Hash for EntryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality_by_bytes() {
        let a = EntryKey::new(&b"k1"[..], 3);
        let b = EntryKey::new(&b"k1"[..], 7);
        let c = EntryKey::new(&b"k2"[..], 3);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn value_carries_type_tag() {
        let val = CacheValue::with_type_tag(&b"payload"[..], 5);
        assert_eq!(val.type_tag(), 5);
        assert_eq!(val.len(), 7);
        assert_eq!(CacheValue::from(vec![1, 2]).type_tag(), TYPE_TAG_BINARY);
    }
}
