use crate::storage::CheckpointSettings;

/// Options controlling how a [`super::Database`] is opened.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Keep every file in memory; checkpoints become no-ops.
    pub in_memory: bool,
    /// Number of frames in the shared buffer pool.
    pub buffer_pool_pages: usize,
    /// Whether commits may trigger a checkpoint.
    pub auto_checkpoint: bool,
    /// Transaction plus WAL bytes that trigger an automatic checkpoint.
    pub checkpoint_threshold: u64,
    /// Create the data file when it does not exist.
    pub create_if_missing: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            in_memory: false,
            buffer_pool_pages: 256,
            auto_checkpoint: true,
            checkpoint_threshold: 16 * 1024 * 1024,
            create_if_missing: true,
        }
    }
}

impl DatabaseOptions {
    /// Options for a purely in-memory database.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    /// Options that only checkpoint on request or at close.
    pub fn manual_checkpoint() -> Self {
        Self {
            auto_checkpoint: false,
            ..Self::default()
        }
    }

    pub(crate) fn checkpoint_settings(&self) -> CheckpointSettings {
        CheckpointSettings {
            in_memory: self.in_memory,
            auto_checkpoint: self.auto_checkpoint,
            checkpoint_threshold: self.checkpoint_threshold,
        }
    }
}
