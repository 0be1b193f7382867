//! Durable storage: shadow paging, metadata blobs and the checkpoint protocol.
//!
//! Page allocation lives in [`crate::primitives::pager`]; this module builds
//! the crash-safe commit path on top of it.

/// Catalog collaborator and the blob-backed catalog.
pub mod catalog;

/// Checkpoint protocol, rollback and startup loading.
pub mod checkpoint;

/// Table storage collaborator and the chunk store.
pub mod chunk_store;

/// Root header at page 0 of the data file.
pub mod header;

/// Page-buffering serializer for metadata blobs.
pub mod meta_writer;

/// Copy-on-write shadow page store.
pub mod shadow;

/// Pin, read and write helpers routed through the shadow file.
pub mod shadow_utils;

mod storage_manager;

pub use catalog::{BlobCatalog, Catalog};
pub use checkpoint::{
    AutoCheckpointContext, CheckpointOutcome, CheckpointSettings, CheckpointStage, Checkpointer,
};
pub use chunk_store::{ChunkLocation, ChunkStore, StorageContext, TableStore};
pub use header::{DatabaseHeader, MAGIC, STORAGE_VERSION};
pub use meta_writer::MetaWriter;
pub use shadow::{ShadowFile, ShadowPageRecord, SHADOW_FILE_ID};
pub use storage_manager::{
    append_suffix, shadow_path, wal_path, StorageManager, DATA_FILE_ID,
};
