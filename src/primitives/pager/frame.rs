use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{lock_api::ArcRwLockWriteGuard, Mutex, RawRwLock, RwLock};
use tracing::trace;

use crate::primitives::io::FileIo;
use crate::types::{page::PAGE_SIZE, FileId, PageId, PenumbraError, Result};

type FrameKey = (FileId, PageId);

/// Whether pinning a page that is not cached loads its bytes from disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageReadPolicy {
    /// Load the page contents, zero-filling past the physical end of the file.
    ReadPage,
    /// Hand out a zeroed frame; the caller overwrites the whole page.
    DontReadPage,
}

struct Frame {
    buf: Arc<RwLock<Box<[u8]>>>,
    pin_count: u32,
    dirty: bool,
    reference: bool,
}

impl Frame {
    fn new(buf: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(buf)),
            pin_count: 0,
            dirty: false,
            reference: true,
        }
    }
}

#[derive(Default)]
struct PoolInner {
    frames: HashMap<FrameKey, Frame>,
    files: HashMap<FileId, Arc<dyn FileIo>>,
    /// Clock order of cached frames. Entries may go stale when a frame is
    /// dropped outside of eviction.
    eviction_queue: VecDeque<FrameKey>,
}

/// Fixed-capacity page cache shared by every file of a database.
pub struct BufferPool {
    capacity: usize,
    inner: Mutex<PoolInner>,
}

/// A pinned frame. The frame cannot be evicted while the guard lives and is
/// unpinned when the guard drops, on error paths and unwinding included.
pub struct PinnedPage {
    /// File the page belongs to.
    pub file_id: FileId,
    /// Page index within that file.
    pub page_id: PageId,
    pool: Arc<BufferPool>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>>,
}

impl PinnedPage {
    /// Returns the page bytes.
    pub fn data(&self) -> &[u8] {
        self.guard
            .as_ref()
            .map(|guard| &guard[..])
            .expect("page guard missing")
    }

    /// Returns the page bytes for writing. Call [`PinnedPage::mark_dirty`]
    /// for the change to be written back.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.guard
            .as_mut()
            .map(|guard| &mut guard[..])
            .expect("page guard missing")
    }

    /// Flags the frame for write-back.
    pub fn mark_dirty(&self) {
        self.pool.set_dirty(self.file_id, self.page_id);
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
        self.pool.unpin(self.file_id, self.page_id);
    }
}

impl BufferPool {
    /// Creates a pool holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Maximum number of cached frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers the backing store used to load and write back pages of `file_id`.
    pub fn register_file(&self, file_id: FileId, io: Arc<dyn FileIo>) {
        self.inner.lock().files.insert(file_id, io);
    }

    /// Pins `page` of `file_id`, loading it according to `policy` on a miss.
    pub fn pin(
        self: &Arc<Self>,
        file_id: FileId,
        page: PageId,
        policy: PageReadPolicy,
    ) -> Result<PinnedPage> {
        let buf = {
            let mut inner = self.inner.lock();
            let key = (file_id, page);
            if !inner.frames.contains_key(&key) {
                if inner.frames.len() >= self.capacity {
                    self.evict_one(&mut inner)?;
                }
                let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
                if policy == PageReadPolicy::ReadPage {
                    let io = inner
                        .files
                        .get(&file_id)
                        .ok_or(PenumbraError::Invalid("file not registered with buffer pool"))?;
                    io.read_at_or_zero(page.byte_offset(), &mut buf)?;
                }
                inner.frames.insert(key, Frame::new(buf));
                inner.eviction_queue.push_back(key);
            }
            let frame = inner
                .frames
                .get_mut(&key)
                .ok_or(PenumbraError::Invalid("frame vanished while pinning"))?;
            frame.pin_count += 1;
            frame.reference = true;
            Arc::clone(&frame.buf)
        };
        Ok(PinnedPage {
            file_id,
            page_id: page,
            pool: Arc::clone(self),
            guard: Some(buf.write_arc()),
        })
    }

    fn evict_one(&self, inner: &mut PoolInner) -> Result<()> {
        // Two sweeps: the first clears reference bits, the second takes any
        // unpinned frame.
        let mut budget = inner.eviction_queue.len() * 2;
        while budget > 0 {
            budget -= 1;
            let Some(key) = inner.eviction_queue.pop_front() else {
                break;
            };
            let Some(frame) = inner.frames.get_mut(&key) else {
                continue;
            };
            if frame.pin_count > 0 || frame.reference {
                frame.reference = false;
                inner.eviction_queue.push_back(key);
                continue;
            }
            let frame = inner
                .frames
                .remove(&key)
                .ok_or(PenumbraError::Invalid("frame vanished during eviction"))?;
            if frame.dirty {
                let io = inner
                    .files
                    .get(&key.0)
                    .ok_or(PenumbraError::Invalid("file not registered with buffer pool"))?;
                let buf = frame.buf.read();
                io.write_at(key.1.byte_offset(), &buf)?;
            }
            trace!(file = %key.0, page = %key.1, dirty = frame.dirty, "buffer_pool.evict");
            return Ok(());
        }
        Err(PenumbraError::Invalid("buffer pool exhausted"))
    }

    fn unpin(&self, file_id: FileId, page: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get_mut(&(file_id, page)) {
            if frame.pin_count > 0 {
                frame.pin_count -= 1;
            }
        }
    }

    fn set_dirty(&self, file_id: FileId, page: PageId) {
        if let Some(frame) = self.inner.lock().frames.get_mut(&(file_id, page)) {
            frame.dirty = true;
        }
    }

    /// Runs `f` over the cached bytes of `page`, or returns `None` on a miss.
    pub fn with_cached_page<R>(
        &self,
        file_id: FileId,
        page: PageId,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let buf = {
            let inner = self.inner.lock();
            Arc::clone(&inner.frames.get(&(file_id, page))?.buf)
        };
        let guard = buf.read();
        Some(f(&guard))
    }

    /// Whether `page` of `file_id` currently occupies a frame.
    pub fn is_cached(&self, file_id: FileId, page: PageId) -> bool {
        self.inner.lock().frames.contains_key(&(file_id, page))
    }

    /// Writes every dirty frame of `file_id` to its backing store.
    pub fn flush_file(&self, file_id: FileId) -> Result<usize> {
        let (io, dirty) = {
            let mut inner = self.inner.lock();
            let io = match inner.files.get(&file_id) {
                Some(io) => Arc::clone(io),
                None => return Ok(0),
            };
            let mut dirty = Vec::new();
            for (key, frame) in inner.frames.iter_mut() {
                if key.0 == file_id && frame.dirty {
                    frame.dirty = false;
                    dirty.push((key.1, Arc::clone(&frame.buf)));
                }
            }
            (io, dirty)
        };
        for (page, buf) in &dirty {
            let guard = buf.read();
            io.write_at(page.byte_offset(), &guard)?;
        }
        Ok(dirty.len())
    }

    /// Drops the cached frame of `page` unless it is pinned.
    ///
    /// Returns true if no frame for the page remains cached.
    pub fn remove_page_if_cached(&self, file_id: FileId, page: PageId) -> bool {
        let mut inner = self.inner.lock();
        match inner.frames.get(&(file_id, page)) {
            Some(frame) if frame.pin_count > 0 => false,
            Some(_) => {
                inner.frames.remove(&(file_id, page));
                true
            }
            None => true,
        }
    }

    /// Overwrites the cached frame of `page` with `bytes`, if one exists.
    pub fn update_frame_if_cached(&self, file_id: FileId, page: PageId, bytes: &[u8]) {
        let buf = {
            let inner = self.inner.lock();
            match inner.frames.get(&(file_id, page)) {
                Some(frame) => Arc::clone(&frame.buf),
                None => return,
            }
        };
        let mut guard = buf.write();
        let len = bytes.len().min(guard.len());
        guard[..len].copy_from_slice(&bytes[..len]);
    }

    /// Discards every frame of `file_id` without writing it back.
    pub fn drop_file_frames(&self, file_id: FileId) {
        self.inner.lock().frames.retain(|key, _| key.0 != file_id);
    }

    /// Discards the frames of `file_id` at or after `first` without writing them back.
    pub fn drop_frames_from(&self, file_id: FileId, first: PageId) {
        self.inner
            .lock()
            .frames
            .retain(|key, _| key.0 != file_id || key.1 < first);
    }

    /// Drops eviction-queue entries whose frame is no longer cached.
    pub fn remove_evicted_candidates(&self) -> usize {
        let mut inner = self.inner.lock();
        let PoolInner {
            frames,
            eviction_queue,
            ..
        } = &mut *inner;
        let before = eviction_queue.len();
        eviction_queue.retain(|key| frames.contains_key(key));
        before - eviction_queue.len()
    }

    /// Number of cached frames.
    pub fn num_cached(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Number of entries in the eviction queue, stale ones included.
    pub fn eviction_queue_len(&self) -> usize {
        self.inner.lock().eviction_queue.len()
    }
}
