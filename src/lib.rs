// AnchorDB - transactional storage core.
//
// ARIES-style write-ahead logging with three-phase crash recovery, plus a
// multigranularity lock manager. The SQL layer, space allocation policy,
// and buffer replacement strategy live elsewhere; this crate owns
// atomicity, durability, and isolation.

pub mod common;
pub mod error;
pub mod storage;
pub mod transaction;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use error::{DbError, Result};

use common::{TransactionId, EFFECTIVE_PAGE_SIZE};
use storage::{BufferPoolManager, DiskSpaceManager};
use transaction::{
    LockManager, LogManager, RecoveryManager, TransactionContext, TxnHandle,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub buffer_pool_capacity: usize,
    /// Payload budget of a single end-checkpoint record, in bytes.
    pub checkpoint_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_capacity: 1000,
            checkpoint_budget: EFFECTIVE_PAGE_SIZE,
        }
    }
}

/// Fully wired storage core: log, disk, buffer pool, recovery, and locks.
///
/// Construction performs the two-phase initialization the cyclic
/// buffer/recovery dependency requires, then either bootstraps a fresh
/// log or runs restart recovery over an existing one.
pub struct StorageCore {
    pub log: Arc<LogManager>,
    pub disk: Arc<DiskSpaceManager>,
    pub buffer: Arc<BufferPoolManager>,
    pub recovery: Arc<RecoveryManager>,
    pub locks: Arc<LockManager>,
    next_txn_id: AtomicU64,
}

impl StorageCore {
    /// Opens the core with a fresh in-memory disk.
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_disk(config, Arc::new(DiskSpaceManager::new()))
    }

    /// Opens the core over an existing disk. Restart recovery runs when
    /// the log already has content; crash tests reuse the disk across
    /// reopenings the way a real platter survives a power cut.
    pub fn open_with_disk(config: &Config, disk: Arc<DiskSpaceManager>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let log = Arc::new(LogManager::open(config.data_dir.join("wal.log"))?);
        let buffer = Arc::new(BufferPoolManager::new(
            config.buffer_pool_capacity,
            Arc::clone(&disk),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            Arc::clone(&log),
            Arc::clone(&disk),
            TxnHandle::factory(),
            config.checkpoint_budget,
        ));
        recovery.set_buffer_manager(Arc::clone(&buffer));
        buffer.set_recovery_manager(&recovery);

        let fresh = log.is_empty();
        let mut max_txn_id = 0;
        if fresh {
            recovery.initialize()?;
        } else {
            max_txn_id = log
                .scan_from(0)
                .filter_map(|(_, record)| record.txn_id())
                .max()
                .unwrap_or(0);
            recovery.restart()?;
        }

        Ok(Self {
            log,
            disk,
            buffer,
            recovery,
            locks: Arc::new(LockManager::new()),
            next_txn_id: AtomicU64::new(max_txn_id + 1),
        })
    }

    /// Starts a new transaction and registers it with the recovery
    /// manager.
    pub fn begin(&self) -> Arc<dyn TransactionContext> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.begin_with_id(txn_id)
    }

    pub fn begin_with_id(&self, txn_id: TransactionId) -> Arc<dyn TransactionContext> {
        let transaction = TxnHandle::new(txn_id) as Arc<dyn TransactionContext>;
        self.recovery.start_transaction(Arc::clone(&transaction));
        transaction
    }

    /// Flushes resident pages, takes a final checkpoint, then closes the
    /// log.
    pub fn close(&self) -> Result<()> {
        self.buffer.flush_all()?;
        self.recovery.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_close_reopen() {
        let dir = tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let disk = Arc::new(DiskSpaceManager::new());
        {
            let core = StorageCore::open_with_disk(&config, Arc::clone(&disk)).unwrap();
            let txn = core.begin();
            assert_eq!(txn.txn_id(), 1);
            core.recovery.commit(txn.txn_id()).unwrap();
            core.recovery.end(txn.txn_id()).unwrap();
            core.close().unwrap();
        }

        let core = StorageCore::open_with_disk(&config, disk).unwrap();
        // Ids never collide with anything already in the log.
        let txn = core.begin();
        assert!(txn.txn_id() > 1);
    }
}
