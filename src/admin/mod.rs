#![forbid(unsafe_code)]

//! Database administration and introspection utilities.
//!
//! This module provides administrative functions for managing penumbra
//! databases: header inspection, free-space listing and checkpoints.

mod checkpoint;
mod error;
mod free_space;
mod header;
mod options;
mod util;

/// Runs a checkpoint on a database file.
///
/// A checkpoint copies committed state into the data file behind a new
/// header and empties the WAL.
pub use checkpoint::{checkpoint, CheckpointReport};

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Paginated view of the free list.
pub use free_space::{free_space, free_space_entries, FreeSpaceEntry, FreeSpaceReport};

/// Header inspection without opening the database.
pub use header::{header_report, HeaderReport};

/// Configuration options for opening a database in admin mode.
pub use options::AdminOpenOptions;

/// Utility functions for opening a database.
pub use util::open_database;
