#![forbid(unsafe_code)]

mod file_handle;
mod frame;
mod freelist;
mod page_manager;
mod range;

pub use file_handle::FileHandle;
pub use frame::{BufferPool, PageReadPolicy, PinnedPage};
pub use freelist::FreeSpaceManager;
pub use page_manager::PageManager;
pub use range::PageRange;
