#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{PenumbraError, Result};

/// In-process single-writer gate.
///
/// At most one write transaction (or checkpoint) holds the gate at a time;
/// readers never take it.
#[derive(Clone, Default)]
pub struct SingleWriter {
    inner: Arc<Mutex<LockState>>,
}

#[derive(Default, Debug)]
struct LockState {
    writer: bool,
    checkpoint: bool,
}

/// Snapshot of the gate for observability.
#[derive(Default, Debug, Clone, Copy)]
pub struct LockSnapshot {
    /// Whether a write transaction holds the gate.
    pub writer: bool,
    /// Whether a checkpoint holds the gate.
    pub checkpoint: bool,
}

/// Held by the active write transaction.
pub struct WriterGuard {
    inner: Arc<Mutex<LockState>>,
}

/// Held while a checkpoint runs outside of a write transaction.
pub struct CheckpointGuard {
    inner: Arc<Mutex<LockState>>,
}

impl SingleWriter {
    /// Creates an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the writer slot or fails if a writer or checkpoint already holds it.
    pub fn acquire_writer(&self) -> Result<WriterGuard> {
        let mut state = self.inner.lock();
        if state.writer {
            return Err(PenumbraError::Invalid("writer lock already held"));
        }
        if state.checkpoint {
            return Err(PenumbraError::Invalid("checkpoint in progress"));
        }
        state.writer = true;
        Ok(WriterGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Takes the checkpoint slot if nobody holds the gate.
    pub fn try_acquire_checkpoint(&self) -> Option<CheckpointGuard> {
        let mut state = self.inner.lock();
        if state.writer || state.checkpoint {
            return None;
        }
        state.checkpoint = true;
        Some(CheckpointGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Returns the current state of the gate.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.inner.lock();
        LockSnapshot {
            writer: state.writer,
            checkpoint: state.checkpoint,
        }
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.inner.lock().writer = false;
    }
}

impl Drop for CheckpointGuard {
    fn drop(&mut self) {
        self.inner.lock().checkpoint = false;
    }
}
