#![forbid(unsafe_code)]
//! Shared identifiers, page constants and the crate error type.

use std::fmt;

mod checksum;

pub use checksum::{record_crc32, Checksum, Crc32Fast};

/// Index of a page within a single file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Identifies a file registered with the buffer pool.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Errors surfaced by the storage core.
#[derive(thiserror::Error, Debug)]
pub enum PenumbraError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// On-disk structures failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The file is not a database file of this build.
    #[error("incompatible database file: {0}")]
    Incompatible(String),
    /// A caller violated an API precondition.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PenumbraError>;

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PageId {
    /// Byte offset of this page inside its file.
    pub fn byte_offset(self) -> u64 {
        self.0 * page::PAGE_SIZE as u64
    }
}

pub mod page {
    //! Page geometry shared by every file of a database.

    use super::PageId;

    /// Size of every page in bytes.
    pub const PAGE_SIZE: usize = 4096;
    /// Page of the data file holding the database header.
    pub const DB_HEADER_PAGE_IDX: PageId = PageId(0);
    /// Sentinel for "no page".
    pub const INVALID_PAGE_IDX: u64 = u64::MAX;

    /// Number of pages required to hold `bytes` bytes.
    pub fn pages_for_bytes(bytes: u64) -> u64 {
        bytes.div_ceil(PAGE_SIZE as u64)
    }
}

/// Kind of transaction driving a page access.
///
/// Only checkpoint transactions observe in-flight shadow pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransactionType {
    /// Snapshot reader.
    ReadOnly,
    /// The single active writer.
    Write,
    /// The checkpointer applying committed state.
    Checkpoint,
    /// WAL replay at startup.
    Recovery,
}

impl TransactionType {
    /// Whether this transaction replays the WAL at startup.
    pub fn is_recovery(self) -> bool {
        matches!(self, TransactionType::Recovery)
    }
}
