use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::PageRange;
use crate::types::{
    page::{pages_for_bytes, DB_HEADER_PAGE_IDX, PAGE_SIZE},
    PenumbraError, Result, TransactionType,
};

use super::catalog::Catalog;
use super::chunk_store::TableStore;
use super::header::DatabaseHeader;
use super::meta_writer::MetaWriter;
use super::shadow_utils::update_page;
use super::storage_manager::StorageManager;

/// Point of the checkpoint protocol after which an injected failure fires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointStage {
    /// Shadow pages and their record table are durable.
    ShadowFlushed,
    /// The WAL checkpoint record is durable.
    WalLogged,
    /// Shadow pages were copied onto the data file.
    ShadowApplied,
}

/// Checkpoint behaviour derived from the database options.
#[derive(Clone, Copy, Debug)]
pub struct CheckpointSettings {
    /// In-memory databases never checkpoint.
    pub in_memory: bool,
    /// Whether commits may trigger a checkpoint.
    pub auto_checkpoint: bool,
    /// Bytes of transaction plus WAL that trigger an automatic checkpoint.
    pub checkpoint_threshold: u64,
}

/// Inputs to [`Checkpointer::can_auto_checkpoint`].
#[derive(Clone, Copy, Debug)]
pub struct AutoCheckpointContext {
    /// Kind of the committing transaction.
    pub trx_type: TransactionType,
    /// Estimated bytes written by the committing transaction.
    pub estimated_txn_bytes: u64,
}

/// What a checkpoint did.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct CheckpointOutcome {
    /// False when the database is in memory.
    pub performed: bool,
    /// Header in effect afterwards.
    pub header: DatabaseHeader,
    /// Whether a new catalog blob was written.
    pub catalog_written: bool,
    /// Whether a new metadata blob was written.
    pub metadata_written: bool,
    /// Pages copied from the shadow file onto the data file.
    pub shadow_pages: usize,
}

/// Drives the checkpoint protocol and owns the header of the last
/// successful checkpoint.
pub struct Checkpointer {
    settings: CheckpointSettings,
    header: DatabaseHeader,
    failpoint: Option<CheckpointStage>,
    /// Set once the WAL checkpoint record is durable; only recovery may
    /// finish the checkpoint from there.
    past_durability_point: bool,
    interrupted: bool,
}

impl Checkpointer {
    /// Creates a checkpointer starting from the default header.
    pub fn new(settings: CheckpointSettings) -> Self {
        Self {
            settings,
            header: DatabaseHeader::default(),
            failpoint: None,
            past_durability_point: false,
            interrupted: false,
        }
    }

    /// Header of the last successful or loaded checkpoint.
    pub fn current_header(&self) -> DatabaseHeader {
        self.header
    }

    #[doc(hidden)]
    pub fn set_failpoint(&mut self, stage: Option<CheckpointStage>) {
        self.failpoint = stage;
    }

    /// Whether the last failed checkpoint can only be completed by recovery.
    pub fn requires_recovery(&self) -> bool {
        self.past_durability_point || self.interrupted
    }

    fn reached(&mut self, stage: CheckpointStage) -> Result<()> {
        debug!(stage = ?stage, "checkpoint.stage");
        if self.failpoint == Some(stage) {
            self.interrupted = true;
            warn!(stage = ?stage, "checkpoint.failpoint");
            return Err(PenumbraError::Invalid("checkpoint interrupted"));
        }
        Ok(())
    }

    /// Makes every committed change durable behind a new header.
    pub fn write_checkpoint<T, C>(
        &mut self,
        storage: &StorageManager<T>,
        catalog: &mut C,
    ) -> Result<CheckpointOutcome>
    where
        T: TableStore,
        C: Catalog + ?Sized,
    {
        if self.settings.in_memory {
            return Ok(CheckpointOutcome {
                performed: false,
                header: self.header,
                catalog_written: false,
                metadata_written: false,
                shadow_pages: 0,
            });
        }
        let started = Instant::now();
        self.past_durability_point = false;
        self.interrupted = false;
        let fh = storage.data_fh();
        let pm = storage.page_manager();
        let shadow = storage.shadow_file();

        // Table data first: it allocates pages the metadata must describe.
        storage.checkpoint()?;

        let mut header = self.header;
        let catalog_written =
            catalog.changed_since_last_checkpoint() || !header.catalog_page_range.is_valid();
        if catalog_written {
            let mut image = Serializer::new();
            catalog.serialize(&mut image);
            let mut blob = Serializer::new();
            blob.write_bytes(image.as_slice());
            let mut writer = MetaWriter::new();
            writer.write(blob.as_slice());
            let range = writer.flush(pm, fh, shadow)?;
            header.update_catalog_page_range(pm, range);
        }

        let metadata_written = catalog_written
            || storage.changed_since_last_checkpoint()
            || !header.metadata_page_range.is_valid();
        if metadata_written {
            header.free_metadata_page_range(pm);
            let mut blob = Serializer::new();
            storage.serialize_tables(&mut blob);
            // Allocation only shrinks the free list, so the estimate taken
            // before reserving the range still bounds the image written after.
            let reserved =
                pages_for_bytes(blob.len() as u64) + pm.estimate_pages_needed_for_serialize();
            let range = pm.allocate_page_range(reserved)?;
            pm.serialize(&mut blob);
            let mut writer = MetaWriter::new();
            writer.write(blob.as_slice());
            writer.flush_into(range, fh, shadow)?;
            header.metadata_page_range = range;
        }
        debug!(
            catalog = %header.catalog_page_range,
            metadata = %header.metadata_page_range,
            catalog_written,
            metadata_written,
            "checkpoint.plan"
        );

        let page = header.encode_page();
        update_page(fh, DB_HEADER_PAGE_IDX, true, shadow, |buf| {
            buf.copy_from_slice(&page);
            Ok(())
        })?;
        fh.materialize_logical_size()?;

        shadow.flush_all()?;
        self.reached(CheckpointStage::ShadowFlushed)?;

        storage.buffer_pool().remove_evicted_candidates();

        storage.wal().log_and_flush_checkpoint()?;
        self.past_durability_point = true;
        self.reached(CheckpointStage::WalLogged)?;

        let shadow_pages = shadow.apply_shadow_pages(fh)?;
        self.reached(CheckpointStage::ShadowApplied)?;

        storage.wal().clear()?;
        shadow.clear()?;

        storage.finalize_checkpoint();
        catalog.reset_version();
        self.header = header;
        self.past_durability_point = false;
        info!(
            shadow_pages,
            catalog_written,
            metadata_written,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint.applied"
        );
        Ok(CheckpointOutcome {
            performed: true,
            header,
            catalog_written,
            metadata_written,
            shadow_pages,
        })
    }

    /// Discards the effects of a checkpoint that failed before its durability point.
    pub fn rollback<T: TableStore>(&mut self, storage: &StorageManager<T>) -> Result<()> {
        if self.settings.in_memory {
            return Ok(());
        }
        storage.rollback_checkpoint()?;
        info!("checkpoint.rollback");
        Ok(())
    }

    /// Loads the catalog and metadata named by the on-disk header.
    pub fn read_checkpoint<T, C>(
        &mut self,
        storage: &StorageManager<T>,
        catalog: &mut C,
    ) -> Result<()>
    where
        T: TableStore,
        C: Catalog + ?Sized,
    {
        if self.settings.in_memory {
            return Ok(());
        }
        let Some(path) = storage.path() else {
            return Ok(());
        };
        if storage.data_fh().num_pages() <= 1 {
            debug!("checkpoint.read.empty");
            return Ok(());
        }
        let io = StdFileIo::open_read_only(path)?;
        let header = match DatabaseHeader::read(&io)? {
            Some(header) => header,
            None => {
                warn!("checkpoint.read.no_header");
                return Ok(());
            }
        };
        if header.catalog_page_range.is_valid() {
            let bytes = read_range(&io, header.catalog_page_range)?;
            let mut de = Deserializer::new(&bytes);
            let image = de.read_bytes()?;
            catalog.deserialize(&mut Deserializer::new(image))?;
        }
        if header.metadata_page_range.is_valid() {
            let bytes = read_range(&io, header.metadata_page_range)?;
            storage.deserialize(&mut Deserializer::new(&bytes))?;
        }
        self.header = header;
        info!(
            catalog = %header.catalog_page_range,
            metadata = %header.metadata_page_range,
            "checkpoint.read"
        );
        Ok(())
    }

    /// Whether a commit described by `ctx` should be followed by a checkpoint.
    pub fn can_auto_checkpoint(&self, ctx: &AutoCheckpointContext, wal_size: u64) -> bool {
        if self.settings.in_memory || !self.settings.auto_checkpoint || ctx.trx_type.is_recovery() {
            return false;
        }
        ctx.estimated_txn_bytes.saturating_add(wal_size) > self.settings.checkpoint_threshold
    }
}

fn read_range(io: &dyn FileIo, range: PageRange) -> Result<Vec<u8>> {
    let len = range
        .num_pages
        .checked_mul(PAGE_SIZE as u64)
        .ok_or(PenumbraError::Corruption("page range too large"))?;
    if range.start_page_idx.saturating_add(range.num_pages) > pages_for_bytes(io.len()?) {
        return Err(PenumbraError::Corruption("page range past end of file"));
    }
    let mut buf = vec![0u8; len as usize];
    io.read_at(range.start_page_idx * PAGE_SIZE as u64, &mut buf)?;
    Ok(buf)
}
