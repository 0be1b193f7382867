//! Page access helpers that route writes through the shadow file.
//!
//! Writes never touch the original file before a checkpoint: the first write
//! to a page copies it into a shadow page and every later write lands there.
//! Only checkpoint transactions read through shadow pages.

use crate::primitives::pager::{FileHandle, PageReadPolicy, PinnedPage};
use crate::types::{page::PAGE_SIZE, PageId, PenumbraError, Result, TransactionType};

use super::shadow::ShadowFile;

/// A pinned shadow page and the original page it stands in for.
pub struct ShadowPageAndFrame {
    /// Page of the original file.
    pub original_page: PageId,
    /// Page of the shadow file holding the pending contents.
    pub shadow_page: PageId,
    /// Pinned shadow frame; unpinned when dropped.
    pub frame: PinnedPage,
}

/// Where a page read should be served from.
pub struct PhysicalPage<'a> {
    /// File to pin or read from.
    pub file: &'a FileHandle,
    /// Page index within `file`.
    pub page: PageId,
}

/// Whether a transaction of `trx_type` observes a pending shadow copy.
pub fn reads_through_shadow(trx_type: TransactionType, has_shadow: bool) -> bool {
    has_shadow && trx_type == TransactionType::Checkpoint
}

fn ensure_disk_backed(fh: &FileHandle) -> Result<()> {
    if fh.is_in_memory() {
        return Err(PenumbraError::Invalid(
            "shadow paging requires a disk-backed file",
        ));
    }
    Ok(())
}

/// Pins the shadow copy of `original_page`, creating it on first use.
///
/// A new shadow page starts as a copy of the original unless
/// `inserting_new_page` is set, in which case it starts zeroed. The frame is
/// marked dirty.
pub fn create_shadow_version_if_necessary_and_pin_page(
    original_page: PageId,
    inserting_new_page: bool,
    fh: &FileHandle,
    shadow_file: &ShadowFile,
) -> Result<ShadowPageAndFrame> {
    ensure_disk_backed(fh)?;
    if let Some(shadow_page) = shadow_file.shadow_page(fh.file_id(), original_page) {
        let frame = shadow_file.pin_shadow_page(shadow_page, PageReadPolicy::ReadPage)?;
        frame.mark_dirty();
        return Ok(ShadowPageAndFrame {
            original_page,
            shadow_page,
            frame,
        });
    }
    // Read the original before registering the shadow so a failed read
    // leaves no half-initialized shadow page behind.
    let original = if inserting_new_page {
        None
    } else {
        Some(fh.optimistic_read_page(original_page, |buf| Ok(buf.to_vec()))?)
    };
    let (shadow_page, _) = shadow_file.get_or_create_shadow_page(fh.file_id(), original_page);
    let mut frame = shadow_file.pin_shadow_page(shadow_page, PageReadPolicy::DontReadPage)?;
    match original {
        Some(bytes) => frame.data_mut().copy_from_slice(&bytes),
        None => frame.data_mut().fill(0),
    }
    frame.mark_dirty();
    Ok(ShadowPageAndFrame {
        original_page,
        shadow_page,
        frame,
    })
}

/// Appends one page to `fh`, shadows it and fills it with `write_fn`.
///
/// Returns the index of the new page in the original file.
pub fn insert_new_page(
    fh: &FileHandle,
    shadow_file: &ShadowFile,
    write_fn: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<PageId> {
    ensure_disk_backed(fh)?;
    let page = fh.add_new_pages(1);
    let mut pinned = create_shadow_version_if_necessary_and_pin_page(page, true, fh, shadow_file)?;
    write_fn(pinned.frame.data_mut())?;
    Ok(page)
}

/// Runs `write_fn` over the shadow copy of `original_page`.
///
/// The shadow frame is unpinned whether or not `write_fn` succeeds; its error
/// is returned unchanged.
pub fn update_page(
    fh: &FileHandle,
    original_page: PageId,
    is_inserting_new_page: bool,
    shadow_file: &ShadowFile,
    write_fn: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<()> {
    let mut pinned = create_shadow_version_if_necessary_and_pin_page(
        original_page,
        is_inserting_new_page,
        fh,
        shadow_file,
    )?;
    write_fn(pinned.frame.data_mut())
}

/// Resolves the physical location a `trx_type` transaction reads `page` from.
pub fn get_file_handle_and_physical_page_idx_to_pin<'a>(
    fh: &'a FileHandle,
    page: PageId,
    shadow_file: &'a ShadowFile,
    trx_type: TransactionType,
) -> PhysicalPage<'a> {
    let shadow = shadow_file.shadow_page(fh.file_id(), page);
    match shadow {
        Some(shadow_page) if reads_through_shadow(trx_type, true) => PhysicalPage {
            file: shadow_file.file_handle(),
            page: shadow_page,
        },
        _ => PhysicalPage { file: fh, page },
    }
}

/// Runs `read_fn` over the existing shadow copy of `original_page`.
pub fn read_shadow_version_of_page<R>(
    fh: &FileHandle,
    original_page: PageId,
    shadow_file: &ShadowFile,
    read_fn: impl FnOnce(&[u8]) -> Result<R>,
) -> Result<R> {
    let shadow_page = shadow_file
        .shadow_page(fh.file_id(), original_page)
        .ok_or(PenumbraError::NotFound)?;
    let frame = shadow_file.pin_shadow_page(shadow_page, PageReadPolicy::ReadPage)?;
    read_fn(frame.data())
}

/// Reads `page` as a `trx_type` transaction sees it.
pub fn read_page<R>(
    fh: &FileHandle,
    page: PageId,
    shadow_file: &ShadowFile,
    trx_type: TransactionType,
    read_fn: impl FnOnce(&[u8]) -> Result<R>,
) -> Result<R> {
    let physical = get_file_handle_and_physical_page_idx_to_pin(fh, page, shadow_file, trx_type);
    physical.file.optimistic_read_page(physical.page, read_fn)
}

/// Copies `bytes` into a page buffer and zeroes the remainder.
pub(crate) fn fill_page(dst: &mut [u8], bytes: &[u8]) {
    debug_assert!(bytes.len() <= PAGE_SIZE);
    dst[..bytes.len()].copy_from_slice(bytes);
    dst[bytes.len()..].fill(0);
}
