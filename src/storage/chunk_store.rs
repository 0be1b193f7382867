use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::pager::{FileHandle, PageManager, PageRange};
use crate::types::{
    page::{pages_for_bytes, PAGE_SIZE},
    PenumbraError, Result, TransactionType,
};

use super::shadow::ShadowFile;
use super::shadow_utils::{fill_page, read_page, update_page};

/// Borrowed storage components handed to table storage during a checkpoint.
pub struct StorageContext<'a> {
    /// The main data file.
    pub data_fh: &'a FileHandle,
    /// Allocator of the data file.
    pub page_manager: &'a PageManager,
    /// Staging area for page writes.
    pub shadow_file: &'a ShadowFile,
}

/// Table and column storage as seen by the checkpointer.
pub trait TableStore: Send {
    /// Writes buffered data to pages, allocating and freeing through the page manager.
    fn checkpoint(&mut self, ctx: &StorageContext<'_>) -> Result<()>;
    /// Undoes the effects of an interrupted [`TableStore::checkpoint`].
    fn rollback_checkpoint(&mut self);
    /// Drops rollback state once the checkpoint is durable.
    fn finalize_checkpoint(&mut self);
    /// Writes the table metadata image.
    fn serialize(&self, ser: &mut Serializer);
    /// Replaces the table metadata with a serialized image.
    fn deserialize(&mut self, de: &mut Deserializer<'_>) -> Result<()>;
    /// Whether anything changed since the last successful checkpoint.
    fn changed_since_last_checkpoint(&self) -> bool;
}

/// Where a persisted chunk lives in the data file.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ChunkLocation {
    /// Pages holding the chunk; invalid for an empty chunk.
    pub range: PageRange,
    /// Chunk length in bytes.
    pub len: u64,
}

type PendingWrites = BTreeMap<String, Option<Vec<u8>>>;

/// Table storage of named byte chunks.
///
/// Writes are buffered in memory and reach the data file only at a
/// checkpoint, each chunk in a freshly allocated page range.
#[derive(Default)]
pub struct ChunkStore {
    persisted: BTreeMap<String, ChunkLocation>,
    /// `None` marks a pending delete.
    pending: PendingWrites,
    rollback_image: Option<(BTreeMap<String, ChunkLocation>, PendingWrites)>,
    version: u64,
}

impl ChunkStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers a write of `name`.
    pub fn put(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.pending.insert(name.into(), Some(bytes));
        self.version += 1;
    }

    /// Buffers a delete of `name`, returning whether it existed.
    pub fn delete(&mut self, name: &str) -> bool {
        let existed = self.contains(name);
        if existed {
            self.pending.insert(name.to_string(), None);
            self.version += 1;
        }
        existed
    }

    /// Whether `name` is visible, counting buffered writes.
    pub fn contains(&self, name: &str) -> bool {
        match self.pending.get(name) {
            Some(value) => value.is_some(),
            None => self.persisted.contains_key(name),
        }
    }

    /// Visible chunk names in order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .persisted
            .keys()
            .filter(|name| !self.pending.contains_key(*name))
            .cloned()
            .collect();
        names.extend(
            self.pending
                .iter()
                .filter(|(_, value)| value.is_some())
                .map(|(name, _)| name.clone()),
        );
        names.sort();
        names
    }

    /// Persisted location of `name`, ignoring buffered writes.
    pub fn location(&self, name: &str) -> Option<ChunkLocation> {
        self.persisted.get(name).copied()
    }

    /// Reads `name` as a `trx_type` transaction sees it.
    pub fn get(
        &self,
        name: &str,
        data_fh: &FileHandle,
        shadow_file: &ShadowFile,
        trx_type: TransactionType,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.pending.get(name) {
            return Ok(value.clone());
        }
        let Some(location) = self.persisted.get(name) else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(location.len as usize);
        for page in location.range.iter_pages() {
            read_page(data_fh, page, shadow_file, trx_type, |buf| {
                out.extend_from_slice(buf);
                Ok(())
            })?;
        }
        out.truncate(location.len as usize);
        Ok(Some(out))
    }

    fn write_chunk(ctx: &StorageContext<'_>, bytes: &[u8]) -> Result<ChunkLocation> {
        if bytes.is_empty() {
            return Ok(ChunkLocation {
                range: PageRange::invalid(),
                len: 0,
            });
        }
        let range = ctx
            .page_manager
            .allocate_page_range(pages_for_bytes(bytes.len() as u64))?;
        for (offset, chunk) in bytes.chunks(PAGE_SIZE).enumerate() {
            update_page(
                ctx.data_fh,
                range.page(offset as u64),
                true,
                ctx.shadow_file,
                |buf| {
                    fill_page(buf, chunk);
                    Ok(())
                },
            )?;
        }
        Ok(ChunkLocation {
            range,
            len: bytes.len() as u64,
        })
    }
}

impl TableStore for ChunkStore {
    fn checkpoint(&mut self, ctx: &StorageContext<'_>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.rollback_image = Some((self.persisted.clone(), self.pending.clone()));
        let pending = std::mem::take(&mut self.pending);
        let written = pending.len();
        for (name, value) in pending {
            if let Some(old) = self.persisted.remove(&name) {
                ctx.page_manager.free_page_range(old.range);
            }
            if let Some(bytes) = value {
                let location = Self::write_chunk(ctx, &bytes)?;
                self.persisted.insert(name, location);
            }
        }
        debug!(written, chunks = self.persisted.len(), "chunk_store.checkpoint");
        Ok(())
    }

    fn rollback_checkpoint(&mut self) {
        if let Some((persisted, pending)) = self.rollback_image.take() {
            self.persisted = persisted;
            self.pending = pending;
        }
    }

    fn finalize_checkpoint(&mut self) {
        self.rollback_image = None;
        self.version = 0;
    }

    fn serialize(&self, ser: &mut Serializer) {
        ser.write_u64(self.persisted.len() as u64);
        for (name, location) in &self.persisted {
            ser.write_str(name);
            location.range.serialize(ser);
            ser.write_u64(location.len);
        }
    }

    fn deserialize(&mut self, de: &mut Deserializer<'_>) -> Result<()> {
        let count = de.read_u64()?;
        if count > de.remaining() as u64 {
            return Err(PenumbraError::Corruption("chunk count too large"));
        }
        let mut persisted = BTreeMap::new();
        for _ in 0..count {
            let name = de.read_string()?;
            let range = PageRange::deserialize(de)?;
            let len = de.read_u64()?;
            if range.is_valid() && len > range.num_pages * PAGE_SIZE as u64 {
                return Err(PenumbraError::Corruption("chunk longer than its page range"));
            }
            persisted.insert(name, ChunkLocation { range, len });
        }
        self.persisted = persisted;
        self.pending.clear();
        self.rollback_image = None;
        self.version = 0;
        Ok(())
    }

    fn changed_since_last_checkpoint(&self) -> bool {
        self.version > 0
    }
}
