// Buffer pool with pin-count frames and write-ahead discipline.
//
// The pool and the recovery manager reference each other (WAL hooks one
// way, page fetches the other), so the recovery side is linked in after
// construction through a set-once weak handle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::common::{Lsn, PageId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::disk::DiskSpaceManager;
use crate::storage::page::Page;
use crate::transaction::recovery::RecoveryManager;

pub use crate::common::EFFECTIVE_PAGE_SIZE;

struct Frame {
    page: Arc<Mutex<Page>>,
    pin_count: usize,
    dirty: bool,
}

/// Page cache in front of the disk space manager.
///
/// A dirty page never reaches disk before the log covering it: every flush
/// path calls the recovery manager's `page_flush_hook` first and its
/// `disk_io_hook` after the write lands.
pub struct BufferPoolManager {
    capacity: usize,
    disk: Arc<DiskSpaceManager>,
    frames: Mutex<HashMap<PageId, Frame>>,
    recovery: OnceCell<Weak<RecoveryManager>>,
}

impl BufferPoolManager {
    pub fn new(capacity: usize, disk: Arc<DiskSpaceManager>) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one frame");
        Self {
            capacity,
            disk,
            frames: Mutex::new(HashMap::new()),
            recovery: OnceCell::new(),
        }
    }

    /// Second phase of the cyclic wiring; may only be called once.
    pub fn set_recovery_manager(&self, recovery: &Arc<RecoveryManager>) {
        self.recovery
            .set(Arc::downgrade(recovery))
            .unwrap_or_else(|_| panic!("recovery manager already wired"));
    }

    fn recovery(&self) -> Option<Arc<RecoveryManager>> {
        self.recovery.get().and_then(Weak::upgrade)
    }

    /// Fetches a page, pinning it for the lifetime of the returned guard.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PinnedPage<'_>> {
        let mut frames = self.frames.lock();

        if let Some(frame) = frames.get_mut(&page_id) {
            frame.pin_count += 1;
            let page = Arc::clone(&frame.page);
            return Ok(PinnedPage {
                pool: self,
                page_id,
                page,
            });
        }

        if frames.len() >= self.capacity {
            self.evict_one(&mut frames)?;
        }

        let page = self.disk.read_page(page_id)?;
        let page = Arc::new(Mutex::new(page));
        frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                dirty: false,
            },
        );
        Ok(PinnedPage {
            pool: self,
            page_id,
            page,
        })
    }

    fn evict_one(&self, frames: &mut HashMap<PageId, Frame>) -> Result<()> {
        let victim = frames
            .iter()
            .find(|(_, frame)| frame.pin_count == 0)
            .map(|(&id, _)| id)
            .ok_or_else(|| DbError::Storage("no evictable frame in buffer pool".to_string()))?;
        self.flush_frame(frames, victim)?;
        frames.remove(&victim);
        Ok(())
    }

    fn flush_frame(&self, frames: &mut HashMap<PageId, Frame>, page_id: PageId) -> Result<()> {
        let Some(frame) = frames.get_mut(&page_id) else {
            return Ok(());
        };
        if !frame.dirty {
            return Ok(());
        }
        let image = frame.page.lock().clone();
        if let Some(recovery) = self.recovery() {
            recovery.page_flush_hook(image.page_lsn())?;
        }
        self.disk.write_page(&image)?;
        frame.dirty = false;
        if let Some(recovery) = self.recovery() {
            recovery.disk_io_hook(page_id);
        }
        Ok(())
    }

    /// Writes a dirty page back to disk without evicting it.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let mut frames = self.frames.lock();
        self.flush_frame(&mut frames, page_id)
    }

    pub fn flush_all(&self) -> Result<()> {
        let mut frames = self.frames.lock();
        let ids: Vec<PageId> = frames.keys().copied().collect();
        for id in ids {
            self.flush_frame(&mut frames, id)?;
        }
        Ok(())
    }

    /// Drops a frame without writing it back. Used when the page itself is
    /// being freed, so its contents no longer matter.
    pub fn discard_page(&self, page_id: PageId) {
        self.frames.lock().remove(&page_id);
    }

    /// Invokes `cb(page_id, dirty)` for every page currently resident.
    pub fn iter_page_nums(&self, mut cb: impl FnMut(PageId, bool)) {
        let frames = self.frames.lock();
        for (&id, frame) in frames.iter() {
            cb(id, frame.dirty);
        }
    }

    /// Logs a page write through the recovery manager, then applies it.
    ///
    /// The before-image is captured from the page's current contents; the
    /// page LSN is stamped with the freshly appended record's LSN.
    pub fn write_logged(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
        offset: u16,
        after: &[u8],
    ) -> Result<Lsn> {
        let recovery = self
            .recovery()
            .ok_or_else(|| DbError::Storage("recovery manager not wired".to_string()))?;
        let pinned = self.fetch_page(page_id)?;
        let before = pinned.read(offset as usize, after.len());
        let lsn = recovery.log_page_write(txn_id, page_id, offset, &before, after)?;
        pinned.with_page(|page| {
            page.write(offset as usize, after);
            page.set_page_lsn(lsn);
        });
        self.mark_dirty(page_id);
        Ok(lsn)
    }

    /// Applies an already-logged change to a page: redo and CLR replay.
    pub fn apply_redo_write(
        &self,
        page_id: PageId,
        offset: u16,
        bytes: &[u8],
        lsn: Lsn,
    ) -> Result<()> {
        let pinned = self.fetch_page(page_id)?;
        pinned.with_page(|page| {
            page.write(offset as usize, bytes);
            page.set_page_lsn(lsn);
        });
        self.mark_dirty(page_id);
        if let Some(recovery) = self.recovery() {
            recovery.dirty_page(page_id, lsn);
        }
        Ok(())
    }

    fn mark_dirty(&self, page_id: PageId) {
        if let Some(frame) = self.frames.lock().get_mut(&page_id) {
            frame.dirty = true;
        }
    }

    fn unpin(&self, page_id: PageId) {
        if let Some(frame) = self.frames.lock().get_mut(&page_id) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }
}

/// Pin guard for a fetched page; unpins on drop, so every exit path of a
/// caller releases the pin.
pub struct PinnedPage<'a> {
    pool: &'a BufferPoolManager,
    page_id: PageId,
    page: Arc<Mutex<Page>>,
}

impl std::fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page_id", &self.page_id)
            .finish()
    }
}

impl PinnedPage<'_> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page.lock().page_lsn()
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.page.lock().read(offset, len).to_vec()
    }

    pub fn with_page<R>(&self, f: impl FnOnce(&mut Page) -> R) -> R {
        f(&mut self.page.lock())
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.pool.unpin(self.page_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::make_page_id;

    fn disk_with_pages(n: u32) -> Arc<DiskSpaceManager> {
        let disk = Arc::new(DiskSpaceManager::new());
        disk.alloc_part(1).unwrap();
        for i in 0..n {
            disk.alloc_page(make_page_id(1, i)).unwrap();
        }
        disk
    }

    #[test]
    fn test_fetch_pins_until_drop() {
        let pool = BufferPoolManager::new(2, disk_with_pages(1));
        let pid = make_page_id(1, 0);
        {
            let pinned = pool.fetch_page(pid).unwrap();
            assert_eq!(pinned.page_id(), pid);
            let frames = pool.frames.lock();
            assert_eq!(frames.get(&pid).unwrap().pin_count, 1);
        }
        let frames = pool.frames.lock();
        assert_eq!(frames.get(&pid).unwrap().pin_count, 0);
    }

    #[test]
    fn test_eviction_prefers_unpinned() {
        let pool = BufferPoolManager::new(1, disk_with_pages(2));
        let first = make_page_id(1, 0);
        let second = make_page_id(1, 1);

        drop(pool.fetch_page(first).unwrap());
        drop(pool.fetch_page(second).unwrap());
        assert!(!pool.frames.lock().contains_key(&first));
    }

    #[test]
    fn test_all_pinned_fails_eviction() {
        let pool = BufferPoolManager::new(1, disk_with_pages(2));
        let _held = pool.fetch_page(make_page_id(1, 0)).unwrap();
        let err = pool.fetch_page(make_page_id(1, 1)).unwrap_err();
        assert!(matches!(err, DbError::Storage(_)));
    }

    #[test]
    fn test_flush_writes_through() {
        let disk = disk_with_pages(1);
        let pool = BufferPoolManager::new(2, Arc::clone(&disk));
        let pid = make_page_id(1, 0);

        let pinned = pool.fetch_page(pid).unwrap();
        pinned.with_page(|page| {
            page.write(0, &[9, 9]);
            page.set_page_lsn(3);
        });
        drop(pinned);
        pool.mark_dirty(pid);
        pool.flush_page(pid).unwrap();

        let on_disk = disk.read_page(pid).unwrap();
        assert_eq!(on_disk.read(0, 2), &[9, 9]);
        assert_eq!(on_disk.page_lsn(), 3);
    }

    #[test]
    fn test_iter_page_nums_reports_dirty() {
        let pool = BufferPoolManager::new(4, disk_with_pages(2));
        let clean = make_page_id(1, 0);
        let dirtied = make_page_id(1, 1);
        drop(pool.fetch_page(clean).unwrap());
        drop(pool.fetch_page(dirtied).unwrap());
        pool.mark_dirty(dirtied);

        let mut seen = Vec::new();
        pool.iter_page_nums(|id, dirty| seen.push((id, dirty)));
        seen.sort_unstable();
        assert_eq!(seen, vec![(clean, false), (dirtied, true)]);
    }
}
