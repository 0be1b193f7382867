use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::io::{FileIo, MemFileIo, StdFileIo};
use crate::primitives::pager::{BufferPool, FileHandle, PageManager};
use crate::primitives::wal::Wal;
use crate::types::{FileId, Result};

use super::chunk_store::{ChunkStore, StorageContext, TableStore};
use super::shadow::ShadowFile;

/// Buffer pool identifier of the main data file.
pub const DATA_FILE_ID: FileId = FileId(0);

/// Appends `suffix` to the file name of `path`.
pub fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Path of the WAL belonging to the data file at `path`.
pub fn wal_path(path: &Path) -> PathBuf {
    append_suffix(path, ".wal")
}

/// Path of the shadow file belonging to the data file at `path`.
pub fn shadow_path(path: &Path) -> PathBuf {
    append_suffix(path, ".shadow")
}

/// Owns the files of one open database and the components built on them.
pub struct StorageManager<T: TableStore = ChunkStore> {
    path: Option<PathBuf>,
    pool: Arc<BufferPool>,
    data_fh: Arc<FileHandle>,
    page_manager: PageManager,
    shadow_file: ShadowFile,
    wal: Wal,
    table_store: Mutex<T>,
}

impl<T: TableStore> StorageManager<T> {
    /// Opens the data file at `path` together with its WAL and a fresh shadow file.
    pub fn open(path: impl AsRef<Path>, buffer_pool_pages: usize, table_store: T) -> Result<Self> {
        let path = path.as_ref();
        let data_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
        let wal_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(wal_path(path))?);
        let shadow_io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(shadow_path(path))?);
        Self::from_parts(
            Some(path.to_path_buf()),
            data_io,
            wal_io,
            shadow_io,
            buffer_pool_pages,
            table_store,
        )
    }

    /// Builds a storage manager whose files live only in memory.
    pub fn in_memory(buffer_pool_pages: usize, table_store: T) -> Result<Self> {
        Self::from_parts(
            None,
            Arc::new(MemFileIo::new()),
            Arc::new(MemFileIo::new()),
            Arc::new(MemFileIo::new()),
            buffer_pool_pages,
            table_store,
        )
    }

    fn from_parts(
        path: Option<PathBuf>,
        data_io: Arc<dyn FileIo>,
        wal_io: Arc<dyn FileIo>,
        shadow_io: Arc<dyn FileIo>,
        buffer_pool_pages: usize,
        table_store: T,
    ) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(buffer_pool_pages));
        // page 0 is always reserved for the database header
        let data_fh = Arc::new(FileHandle::open(DATA_FILE_ID, data_io, Arc::clone(&pool), 1)?);
        let shadow_file = ShadowFile::open(shadow_io, Arc::clone(&pool))?;
        let wal = Wal::open(wal_io)?;
        Ok(Self {
            path,
            page_manager: PageManager::new(Arc::clone(&data_fh)),
            pool,
            data_fh,
            shadow_file,
            wal,
            table_store: Mutex::new(table_store),
        })
    }

    /// Path of the data file; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the database lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.data_fh.is_in_memory()
    }

    /// The main data file.
    pub fn data_fh(&self) -> &Arc<FileHandle> {
        &self.data_fh
    }

    /// Allocator of the data file.
    pub fn page_manager(&self) -> &PageManager {
        &self.page_manager
    }

    /// Staging area for page writes.
    pub fn shadow_file(&self) -> &ShadowFile {
        &self.shadow_file
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Shared buffer pool.
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Locks the table store.
    pub fn table_store(&self) -> MutexGuard<'_, T> {
        self.table_store.lock()
    }

    fn context(&self) -> StorageContext<'_> {
        StorageContext {
            data_fh: &self.data_fh,
            page_manager: &self.page_manager,
            shadow_file: &self.shadow_file,
        }
    }

    /// Flushes buffered table data through the shadow file.
    pub fn checkpoint(&self) -> Result<()> {
        let ctx = self.context();
        self.table_store.lock().checkpoint(&ctx)
    }

    /// Undoes an interrupted checkpoint: table state, allocations and shadow pages.
    pub fn rollback_checkpoint(&self) -> Result<()> {
        self.table_store.lock().rollback_checkpoint();
        self.page_manager.rollback();
        self.shadow_file.clear()
    }

    /// Makes the allocations and shadow pages of a write transaction part of
    /// the next checkpoint.
    pub fn commit_transaction(&self) {
        self.page_manager.commit();
        self.shadow_file.commit();
    }

    /// Reclaims the allocations and shadow pages of an aborted write transaction.
    pub fn rollback_transaction(&self) -> Result<()> {
        self.page_manager.rollback();
        self.shadow_file.rollback_uncommitted()?;
        Ok(())
    }

    /// Runs once the checkpoint is durable.
    pub fn finalize_checkpoint(&self) {
        self.table_store.lock().finalize_checkpoint();
        self.page_manager.finalize_checkpoint();
    }

    /// Whether table data or page allocations changed since the last checkpoint.
    pub fn changed_since_last_checkpoint(&self) -> bool {
        self.table_store.lock().changed_since_last_checkpoint()
            || self.page_manager.changed_since_last_checkpoint()
    }

    /// Writes the length-prefixed table metadata image.
    pub fn serialize_tables(&self, ser: &mut Serializer) {
        let mut image = Serializer::new();
        self.table_store.lock().serialize(&mut image);
        ser.write_bytes(image.as_slice());
    }

    /// Loads the metadata blob: table metadata followed by the free-space state.
    pub fn deserialize(&self, de: &mut Deserializer<'_>) -> Result<()> {
        let image = de.read_bytes()?;
        self.table_store
            .lock()
            .deserialize(&mut Deserializer::new(image))?;
        self.page_manager.deserialize(de)
    }
}
