use crate::db::DatabaseOptions;

/// Common options used when opening a database for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Frames in the buffer pool of the opened database.
    pub buffer_pool_pages: usize,
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            buffer_pool_pages: DatabaseOptions::default().buffer_pool_pages,
            create_if_missing: false,
        }
    }
}

impl AdminOpenOptions {
    pub(crate) fn database_options(&self) -> DatabaseOptions {
        DatabaseOptions {
            buffer_pool_pages: self.buffer_pool_pages,
            auto_checkpoint: false,
            create_if_missing: self.create_if_missing,
            ..DatabaseOptions::default()
        }
    }
}
