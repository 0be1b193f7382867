use std::collections::BTreeMap;

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::types::{PenumbraError, Result};

/// Schema-level state persisted in the catalog blob at every checkpoint.
pub trait Catalog: Send {
    /// Writes the catalog image.
    fn serialize(&self, ser: &mut Serializer);
    /// Replaces the in-memory catalog with a serialized image.
    fn deserialize(&mut self, de: &mut Deserializer<'_>) -> Result<()>;
    /// Whether the catalog changed since the last successful checkpoint.
    fn changed_since_last_checkpoint(&self) -> bool;
    /// Marks the current state as checkpointed.
    fn reset_version(&mut self);
}

/// Catalog of named opaque entries.
#[derive(Clone, Debug, Default)]
pub struct BlobCatalog {
    entries: BTreeMap<String, Vec<u8>>,
    version: u64,
}

impl BlobCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `name`.
    pub fn put(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.entries.insert(name.into(), value);
        self.version += 1;
    }

    /// Removes `name`, returning whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let removed = self.entries.remove(name).is_some();
        if removed {
            self.version += 1;
        }
        removed
    }

    /// Value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.get(name).map(Vec::as_slice)
    }

    /// Entry names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the catalog has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Catalog for BlobCatalog {
    fn serialize(&self, ser: &mut Serializer) {
        ser.write_u64(self.entries.len() as u64);
        for (name, value) in &self.entries {
            ser.write_str(name);
            ser.write_bytes(value);
        }
    }

    fn deserialize(&mut self, de: &mut Deserializer<'_>) -> Result<()> {
        let count = de.read_u64()?;
        if count > de.remaining() as u64 {
            return Err(PenumbraError::Corruption("catalog entry count too large"));
        }
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let name = de.read_string()?;
            let value = de.read_bytes()?.to_vec();
            entries.insert(name, value);
        }
        self.entries = entries;
        self.version = 0;
        Ok(())
    }

    fn changed_since_last_checkpoint(&self) -> bool {
        self.version > 0
    }

    fn reset_version(&mut self) {
        self.version = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_image_roundtrip() {
        let mut catalog = BlobCatalog::new();
        catalog.put("person", b"schema:v1".to_vec());
        catalog.put("knows", Vec::new());
        let mut ser = Serializer::new();
        catalog.serialize(&mut ser);
        let bytes = ser.into_inner();

        let mut restored = BlobCatalog::new();
        restored.deserialize(&mut Deserializer::new(&bytes)).unwrap();
        assert_eq!(restored.get("person"), Some(&b"schema:v1"[..]));
        assert_eq!(restored.names().collect::<Vec<_>>(), vec!["knows", "person"]);
        assert!(!restored.changed_since_last_checkpoint());
    }

    #[test]
    fn only_effective_changes_bump_the_version() {
        let mut catalog = BlobCatalog::new();
        assert!(!catalog.remove("missing"));
        assert!(!catalog.changed_since_last_checkpoint());
        catalog.put("a", vec![1]);
        assert!(catalog.changed_since_last_checkpoint());
        catalog.reset_version();
        assert!(!catalog.changed_since_last_checkpoint());
    }
}
