//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, I/O operations, the single-writer gate,
//! the write-ahead log (WAL), and the paging layer.

/// Byte-level serialization.
///
/// Big-endian serializer and bounds-checked deserializer for persisted blobs.
pub mod bytes;

/// Concurrency primitives and synchronization.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes over OS files or heap buffers.
pub mod io;

/// Paging subsystem: buffer pool, file handles and the page allocator.
pub mod pager;

/// Write-ahead logging (WAL) for crash recovery.
///
/// Holds committed transactions and the checkpoint durability marker.
pub mod wal;
