//! Storage allocator and crash-recovery core of an embedded graph database.
//!
//! The data file is carved into fixed-size pages handed out by a
//! [`PageManager`](primitives::pager::PageManager). Committed writes reach the
//! data file only through a checkpoint, which stages every page in a shadow
//! file, publishes a new [`DatabaseHeader`](storage::DatabaseHeader) at page 0
//! and then copies the staged pages in place. A crash at any point leaves
//! either the previous checkpoint or a WAL that recovery can finish.

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{Database, DatabaseOptions, RecoveryMode, RecoveryReport, TxState, WriteTxn};
pub use types::{FileId, PageId, PenumbraError, Result, TransactionType};
