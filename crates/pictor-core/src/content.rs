//! Inline content table
//!
//! Clients may send large payloads once in a request's content table and
//! refer to them elsewhere by SHA-256. A payload of exactly 32 bytes is a
//! reference.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Size of a content reference
pub const CONTENT_REFERENCE_LEN: usize = 32;

/// Content entries keyed by their SHA-256
#[derive(Debug, Default, Clone)]
pub struct ContentTable {
    entries: HashMap<[u8; 32], Vec<u8>>,
}

impl ContentTable {
    /// Index the given entries
    pub fn new(contents: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let entries = contents
            .into_iter()
            .map(|content| {
                let digest: [u8; 32] = Sha256::digest(&content).into();
                (digest, content)
            })
            .collect();
        Self { entries }
    }

    /// Number of distinct entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a payload.
    ///
    /// A 32-byte payload is looked up by hash and becomes empty when the
    /// table has no such entry. Any other payload is returned unchanged.
    pub fn resolve(&self, payload: Vec<u8>) -> Vec<u8> {
        if payload.len() != CONTENT_REFERENCE_LEN {
            return payload;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&payload);
        self.entries.get(&key).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_resolves_to_content() {
        let image = vec![7u8; 1000];
        let table = ContentTable::new(vec![image.clone()]);
        let reference = Sha256::digest(&image).to_vec();

        assert_eq!(table.resolve(reference), image);
    }

    #[test]
    fn test_unknown_reference_becomes_empty() {
        let table = ContentTable::new(vec![b"something".to_vec()]);
        assert!(table.resolve(vec![0u8; 32]).is_empty());
    }

    #[test]
    fn test_inline_payload_passes_through() {
        let table = ContentTable::default();
        assert_eq!(table.resolve(vec![1, 2, 3]), vec![1, 2, 3]);
        assert!(table.resolve(Vec::new()).is_empty());
    }
}
