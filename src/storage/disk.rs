// Disk space management: partitions and the pages inside them.
//
// Allocation and free are write-through: the moment they return, the
// platter reflects the change. That is why the recovery manager flushes
// the log before invoking them.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::common::{
    page_index, partition_of, PageId, PartitionId, LOG_PARTITION,
};
use crate::error::{DbError, Result};
use crate::storage::page::Page;

#[derive(Default)]
struct DiskState {
    partitions: HashSet<PartitionId>,
    pages: HashMap<PageId, Page>,
}

/// Tracks which partitions and pages exist and holds their durable images.
///
/// Partition 0 is reserved for the write-ahead log and is pre-allocated; the
/// recovery manager never emits records for it.
pub struct DiskSpaceManager {
    state: RwLock<DiskState>,
}

impl DiskSpaceManager {
    pub fn new() -> Self {
        let mut state = DiskState::default();
        state.partitions.insert(LOG_PARTITION);
        Self {
            state: RwLock::new(state),
        }
    }

    /// Returns the partition a page lives in.
    pub fn get_part_num(&self, page_id: PageId) -> PartitionId {
        partition_of(page_id)
    }

    pub fn alloc_part(&self, partition: PartitionId) -> Result<PartitionId> {
        let mut state = self.state.write();
        if !state.partitions.insert(partition) {
            return Err(DbError::AlreadyExists(format!("partition {}", partition)));
        }
        Ok(partition)
    }

    /// Frees a partition along with every page still allocated in it.
    pub fn free_part(&self, partition: PartitionId) -> Result<()> {
        if partition == LOG_PARTITION {
            return Err(DbError::Storage("cannot free the log partition".to_string()));
        }
        let mut state = self.state.write();
        if !state.partitions.remove(&partition) {
            return Err(DbError::NotFound(format!("partition {}", partition)));
        }
        state.pages.retain(|&id, _| partition_of(id) != partition);
        Ok(())
    }

    pub fn alloc_page(&self, page_id: PageId) -> Result<PageId> {
        let mut state = self.state.write();
        if !state.partitions.contains(&partition_of(page_id)) {
            return Err(DbError::NotFound(format!(
                "partition {} for page {}",
                partition_of(page_id),
                page_index(page_id)
            )));
        }
        if state.pages.contains_key(&page_id) {
            return Err(DbError::AlreadyExists(format!("page {}", page_id)));
        }
        state.pages.insert(page_id, Page::new(page_id));
        Ok(page_id)
    }

    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.write();
        if state.pages.remove(&page_id).is_none() {
            return Err(DbError::NotFound(format!("page {}", page_id)));
        }
        Ok(())
    }

    pub fn page_exists(&self, page_id: PageId) -> bool {
        self.state.read().pages.contains_key(&page_id)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.state
            .read()
            .pages
            .get(&page_id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("page {}", page_id)))
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        let mut state = self.state.write();
        match state.pages.get_mut(&page.id()) {
            Some(stored) => {
                *stored = page.clone();
                Ok(())
            }
            None => Err(DbError::NotFound(format!("page {}", page.id()))),
        }
    }
}

impl Default for DiskSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::make_page_id;

    #[test]
    fn test_alloc_and_free_partition() {
        let disk = DiskSpaceManager::new();
        disk.alloc_part(1).unwrap();
        assert!(matches!(disk.alloc_part(1), Err(DbError::AlreadyExists(_))));
        disk.free_part(1).unwrap();
        assert!(matches!(disk.free_part(1), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_log_partition_protected() {
        let disk = DiskSpaceManager::new();
        assert!(disk.free_part(LOG_PARTITION).is_err());
    }

    #[test]
    fn test_page_lifecycle() {
        let disk = DiskSpaceManager::new();
        disk.alloc_part(1).unwrap();
        let pid = make_page_id(1, 0);

        disk.alloc_page(pid).unwrap();
        assert!(disk.page_exists(pid));
        assert_eq!(disk.get_part_num(pid), 1);

        let mut page = disk.read_page(pid).unwrap();
        page.write(0, &[1, 2, 3]);
        page.set_page_lsn(5);
        disk.write_page(&page).unwrap();

        let reread = disk.read_page(pid).unwrap();
        assert_eq!(reread.read(0, 3), &[1, 2, 3]);
        assert_eq!(reread.page_lsn(), 5);

        disk.free_page(pid).unwrap();
        assert!(!disk.page_exists(pid));
    }

    #[test]
    fn test_alloc_page_needs_partition() {
        let disk = DiskSpaceManager::new();
        assert!(matches!(
            disk.alloc_page(make_page_id(9, 0)),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_free_part_drops_pages() {
        let disk = DiskSpaceManager::new();
        disk.alloc_part(2).unwrap();
        let pid = make_page_id(2, 4);
        disk.alloc_page(pid).unwrap();
        disk.free_part(2).unwrap();
        assert!(!disk.page_exists(pid));
    }
}
