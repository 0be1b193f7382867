use std::convert::TryInto;

use serde::Serialize;

use crate::primitives::bytes::{Deserializer, Serializer};
use crate::primitives::io::FileIo;
use crate::primitives::pager::{PageManager, PageRange};
use crate::types::{page::PAGE_SIZE, PenumbraError, Result};

/// Magic bytes at the start of page 0 of every data file.
pub const MAGIC: [u8; 8] = *b"PENUMBRA";
/// On-disk format version written by this build.
pub const STORAGE_VERSION: u64 = 1;
/// Encoded header length: magic, version, two page ranges.
pub const HEADER_LEN: usize = 8 + 8 + 16 + 16;

/// Root record at page 0 naming the catalog and metadata blobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct DatabaseHeader {
    /// Format version of the file.
    pub storage_version: u64,
    /// Pages holding the serialized catalog.
    pub catalog_page_range: PageRange,
    /// Pages holding the table store and free-space state.
    pub metadata_page_range: PageRange,
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self {
            storage_version: STORAGE_VERSION,
            catalog_page_range: PageRange::invalid(),
            metadata_page_range: PageRange::invalid(),
        }
    }
}

impl DatabaseHeader {
    /// Encodes the header into a zero-padded page image.
    pub fn encode_page(&self) -> Vec<u8> {
        let mut ser = Serializer::new();
        ser.write_raw(&MAGIC);
        ser.write_u64(self.storage_version);
        self.catalog_page_range.serialize(&mut ser);
        self.metadata_page_range.serialize(&mut ser);
        let mut page = ser.into_inner();
        page.resize(PAGE_SIZE, 0);
        page
    }

    /// Decodes and validates a header page. A foreign magic or a different
    /// storage version is reported as [`PenumbraError::Incompatible`].
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < HEADER_LEN {
            return Err(PenumbraError::Corruption("database header truncated"));
        }
        let mut de = Deserializer::new(&page[..HEADER_LEN]);
        let magic: [u8; 8] = de.take(MAGIC.len())?.try_into().unwrap();
        if magic != MAGIC {
            return Err(PenumbraError::Incompatible(format!(
                "unexpected magic bytes {:02x?}; the file is not a penumbra database",
                magic
            )));
        }
        let storage_version = de.read_u64()?;
        if storage_version != STORAGE_VERSION {
            return Err(PenumbraError::Incompatible(format!(
                "storage version {storage_version} does not match supported version {STORAGE_VERSION}"
            )));
        }
        Ok(Self {
            storage_version,
            catalog_page_range: PageRange::deserialize(&mut de)?,
            metadata_page_range: PageRange::deserialize(&mut de)?,
        })
    }

    /// Reads the header at page 0 of `io`.
    ///
    /// Returns `None` when the file is shorter than a page or the header area
    /// is all zeros, meaning no checkpoint has completed yet.
    pub fn read(io: &dyn FileIo) -> Result<Option<Self>> {
        if io.len()? < PAGE_SIZE as u64 {
            return Ok(None);
        }
        let mut page = vec![0u8; PAGE_SIZE];
        io.read_at(0, &mut page)?;
        if page[..HEADER_LEN].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        Self::decode(&page).map(Some)
    }

    /// Records a new catalog range, freeing the previous one.
    pub fn update_catalog_page_range(&mut self, page_manager: &PageManager, range: PageRange) {
        if self.catalog_page_range.is_valid() {
            page_manager.free_page_range(self.catalog_page_range);
        }
        self.catalog_page_range = range;
    }

    /// Frees the current metadata range ahead of rewriting the metadata blob.
    pub fn free_metadata_page_range(&mut self, page_manager: &PageManager) {
        if self.metadata_page_range.is_valid() {
            page_manager.free_page_range(self.metadata_page_range);
        }
        self.metadata_page_range = PageRange::invalid();
    }
}
