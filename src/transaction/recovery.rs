// ARIES-style recovery manager.
//
// Forward path: every mutation of a page or of the disk layout is logged
// before it happens, commits force the log, and aborts defer their
// rollback to `end`. Restart runs analysis, redo, and undo over the same
// record model, then leaves behind a fresh checkpoint.
//
// The dirty page table and transaction table are concurrent maps because
// buffer-pool threads fire `page_flush_hook`/`disk_io_hook`/`dirty_page`
// while transactions are still logging. Commit, end, and checkpoint
// serialize on one coarse mutex.

use std::collections::{BinaryHeap, BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::common::{
    partition_of, Lsn, PageId, PartitionId, TransactionId, EFFECTIVE_PAGE_SIZE, LOG_PARTITION,
    NO_LSN,
};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskSpaceManager;

use super::records::{checkpoint_fits, LogRecord};
use super::traits::{TransactionContext, TransactionFactory};
use super::types::TransactionStatus;
use super::wal::LogManager;

/// Per-transaction bookkeeping while the transaction is live.
struct TransactionTableEntry {
    transaction: Arc<dyn TransactionContext>,
    /// LSN of the most recent record for this transaction; 0 = none yet.
    last_lsn: Lsn,
    savepoints: HashMap<String, Lsn>,
    touched_pages: BTreeSet<PageId>,
}

impl TransactionTableEntry {
    fn new(transaction: Arc<dyn TransactionContext>) -> Self {
        Self {
            transaction,
            last_lsn: NO_LSN,
            savepoints: HashMap::new(),
            touched_pages: BTreeSet::new(),
        }
    }
}

pub struct RecoveryManager {
    log: Arc<LogManager>,
    disk: Arc<DiskSpaceManager>,
    buffer: OnceCell<Arc<BufferPoolManager>>,
    txn_table: DashMap<TransactionId, TransactionTableEntry>,
    dirty_page_table: DashMap<PageId, Lsn>,
    new_transaction: TransactionFactory,
    /// Gate on `disk_io_hook`: while restart is rebuilding the dirty page
    /// table, completed page writes must not erode it.
    redo_complete: AtomicBool,
    /// Serializes commit, end, and checkpoint against each other.
    op_lock: Mutex<()>,
    /// Payload budget of a single end-checkpoint record.
    checkpoint_budget: usize,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<LogManager>,
        disk: Arc<DiskSpaceManager>,
        new_transaction: TransactionFactory,
        checkpoint_budget: usize,
    ) -> Self {
        Self {
            log,
            disk,
            buffer: OnceCell::new(),
            txn_table: DashMap::new(),
            dirty_page_table: DashMap::new(),
            new_transaction,
            redo_complete: AtomicBool::new(true),
            op_lock: Mutex::new(()),
            checkpoint_budget,
        }
    }

    /// Second phase of the cyclic wiring; may only be called once.
    pub fn set_buffer_manager(&self, buffer: Arc<BufferPoolManager>) {
        self.buffer
            .set(buffer)
            .unwrap_or_else(|_| panic!("buffer manager already wired"));
    }

    fn buffer(&self) -> &BufferPoolManager {
        self.buffer.get().expect("buffer manager not wired")
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    // ========================================================================
    // Forward path
    // ========================================================================

    /// Sets up a fresh database: master record plus an initial checkpoint.
    pub fn initialize(&self) -> Result<()> {
        assert!(self.log.is_empty(), "initialize called on a non-empty log");
        self.log
            .append(LogRecord::Master { last_checkpoint_lsn: NO_LSN })?;
        self.checkpoint()
    }

    /// Registers a running transaction with the recovery manager.
    pub fn start_transaction(&self, transaction: Arc<dyn TransactionContext>) {
        let txn_id = transaction.txn_id();
        let previous = self
            .txn_table
            .insert(txn_id, TransactionTableEntry::new(transaction));
        assert!(previous.is_none(), "transaction {} already started", txn_id);
    }

    /// Logs a byte-range write on a page and returns the record's LSN.
    ///
    /// The caller applies the change and stamps the page LSN afterwards;
    /// the record exists in the log before the page can ever reach disk.
    pub fn log_page_write(
        &self,
        txn_id: TransactionId,
        page_id: PageId,
        offset: u16,
        before: &[u8],
        after: &[u8],
    ) -> Result<Lsn> {
        assert_eq!(
            before.len(),
            after.len(),
            "before and after images must have equal length"
        );
        assert!(
            before.len() <= EFFECTIVE_PAGE_SIZE / 2,
            "page write images exceed half a page"
        );
        assert_ne!(
            partition_of(page_id),
            LOG_PARTITION,
            "page writes on the log partition are not logged"
        );

        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        let lsn = self.log.append(LogRecord::UpdatePage {
            txn_id,
            prev_lsn: entry.last_lsn,
            page_id,
            offset,
            before: before.to_vec(),
            after: after.to_vec(),
        })?;
        entry.last_lsn = lsn;
        entry.touched_pages.insert(page_id);
        drop(entry);

        self.dirty_page_table.entry(page_id).or_insert(lsn);
        Ok(lsn)
    }

    /// Logs a page allocation and forces the log through it. Returns the
    /// LSN, or `-1` for pages in the log partition (which are ignored).
    pub fn log_alloc_page(&self, txn_id: TransactionId, page_id: PageId) -> Result<i64> {
        if partition_of(page_id) == LOG_PARTITION {
            return Ok(-1);
        }
        let lsn = self.append_flushed(txn_id, |prev_lsn| LogRecord::AllocPage {
            txn_id,
            prev_lsn,
            page_id,
        })?;
        Ok(lsn as i64)
    }

    /// Logs a page free and forces the log through it. The page no longer
    /// needs recovery, so it also leaves the dirty page table.
    pub fn log_free_page(&self, txn_id: TransactionId, page_id: PageId) -> Result<i64> {
        if partition_of(page_id) == LOG_PARTITION {
            return Ok(-1);
        }
        let lsn = self.append_flushed(txn_id, |prev_lsn| LogRecord::FreePage {
            txn_id,
            prev_lsn,
            page_id,
        })?;
        self.dirty_page_table.remove(&page_id);
        Ok(lsn as i64)
    }

    pub fn log_alloc_part(&self, txn_id: TransactionId, partition: PartitionId) -> Result<i64> {
        if partition == LOG_PARTITION {
            return Ok(-1);
        }
        let lsn = self.append_flushed(txn_id, |prev_lsn| LogRecord::AllocPart {
            txn_id,
            prev_lsn,
            partition,
        })?;
        Ok(lsn as i64)
    }

    pub fn log_free_part(&self, txn_id: TransactionId, partition: PartitionId) -> Result<i64> {
        if partition == LOG_PARTITION {
            return Ok(-1);
        }
        let lsn = self.append_flushed(txn_id, |prev_lsn| LogRecord::FreePart {
            txn_id,
            prev_lsn,
            partition,
        })?;
        Ok(lsn as i64)
    }

    /// Appends a record chained to the transaction's last LSN and flushes
    /// the log through it. Allocation records are applied to disk the
    /// moment the collaborator returns, so they must already be durable.
    fn append_flushed(
        &self,
        txn_id: TransactionId,
        make: impl FnOnce(Lsn) -> LogRecord,
    ) -> Result<Lsn> {
        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        let lsn = self.log.append(make(entry.last_lsn))?;
        entry.last_lsn = lsn;
        drop(entry);
        self.log.flush_to(lsn)?;
        Ok(lsn)
    }

    /// Commits a transaction: the commit record is durable on return.
    pub fn commit(&self, txn_id: TransactionId) -> Result<Lsn> {
        let _guard = self.op_lock.lock();
        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        let lsn = self.log.append(LogRecord::CommitTxn {
            txn_id,
            prev_lsn: entry.last_lsn,
        })?;
        self.log.flush_to(lsn)?;
        entry.transaction.set_status(TransactionStatus::Committing);
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// Marks a transaction aborting. The rollback itself happens in `end`.
    pub fn abort(&self, txn_id: TransactionId) -> Result<Lsn> {
        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        let lsn = self.log.append(LogRecord::AbortTxn {
            txn_id,
            prev_lsn: entry.last_lsn,
        })?;
        entry.transaction.set_status(TransactionStatus::Aborting);
        entry.last_lsn = lsn;
        Ok(lsn)
    }

    /// Finishes a transaction. An aborting transaction is rolled back to
    /// its start first; the end record then chains to the last CLR. A
    /// non-aborting transaction's end record chains to its last LSN as it
    /// stood before `end` was called.
    pub fn end(&self, txn_id: TransactionId) -> Result<Lsn> {
        let _guard = self.op_lock.lock();
        let (transaction, pre_rollback_lsn, aborting) = {
            let entry = self
                .txn_table
                .get(&txn_id)
                .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
            (
                Arc::clone(&entry.transaction),
                entry.last_lsn,
                entry.transaction.status() == TransactionStatus::Aborting,
            )
        };

        let prev_lsn = if aborting {
            self.rollback_to_lsn(txn_id, NO_LSN)?
        } else {
            pre_rollback_lsn
        };

        self.txn_table.remove(&txn_id);
        transaction.set_status(TransactionStatus::Complete);
        self.log.append(LogRecord::EndTxn { txn_id, prev_lsn })
    }

    /// Records the transaction's current last LSN under `name`,
    /// overwriting any savepoint of the same name.
    pub fn savepoint(&self, txn_id: TransactionId, name: impl Into<String>) {
        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        let lsn = entry.last_lsn;
        entry.savepoints.insert(name.into(), lsn);
    }

    pub fn release_savepoint(&self, txn_id: TransactionId, name: &str) {
        let mut entry = self
            .txn_table
            .get_mut(&txn_id)
            .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
        entry.savepoints.remove(name);
    }

    /// Rolls back every change made after the savepoint was taken. The
    /// transaction keeps running; its status does not change.
    pub fn rollback_to_savepoint(&self, txn_id: TransactionId, name: &str) -> Result<Lsn> {
        let target = {
            let entry = self
                .txn_table
                .get(&txn_id)
                .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
            entry.savepoints.get(name).copied().ok_or_else(|| {
                crate::transaction::TransactionError::savepoint_not_found(txn_id, name)
            })?
        };
        self.rollback_to_lsn(txn_id, target)
    }

    /// Undoes the transaction's records down to, but not including,
    /// `target_lsn`. Returns the LSN the next record for this transaction
    /// should chain to (the last CLR appended, or the last LSN unchanged
    /// when nothing was undoable).
    ///
    /// Records at exactly `target_lsn` survive: the comparison is strict,
    /// so a savepoint taken right before an update does not undo it.
    fn rollback_to_lsn(&self, txn_id: TransactionId, target_lsn: Lsn) -> Result<Lsn> {
        let last_lsn = {
            let entry = self
                .txn_table
                .get(&txn_id)
                .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
            entry.last_lsn
        };

        let mut current = if last_lsn == NO_LSN {
            NO_LSN
        } else {
            let last_record = self.log.fetch(last_lsn)?;
            // A CLR already names the next record to visit; skip there.
            last_record.undo_next_lsn().unwrap_or(last_lsn)
        };
        let mut clr_prev = last_lsn;

        while current > target_lsn {
            let record = self.log.fetch(current)?;
            if record.is_undoable() {
                let clr = record.undo(clr_prev);
                let clr_lsn = self.log.append(clr.clone())?;
                clr_prev = clr_lsn;
                {
                    let mut entry = self
                        .txn_table
                        .get_mut(&txn_id)
                        .unwrap_or_else(|| panic!("unknown transaction {}", txn_id));
                    entry.last_lsn = clr_lsn;
                }
                clr.redo(clr_lsn, &self.disk, self.buffer())?;
            }
            current = match record.undo_next_lsn().or(record.prev_lsn()) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(clr_prev)
    }

    /// Takes a fuzzy checkpoint: a begin record, one or more end records
    /// carrying the dirty page table and transaction table, a flush, and a
    /// master-record rewrite pointing at the begin record.
    pub fn checkpoint(&self) -> Result<()> {
        let _guard = self.op_lock.lock();
        let begin_lsn = self.log.append(LogRecord::BeginCheckpoint)?;
        debug!(begin_lsn, "checkpoint started");

        let mut dirty_pages: BTreeMap<PageId, Lsn> = BTreeMap::new();
        let mut active_txns: BTreeMap<TransactionId, (TransactionStatus, Lsn)> = BTreeMap::new();

        for item in self.dirty_page_table.iter() {
            if !checkpoint_fits(dirty_pages.len() + 1, active_txns.len(), self.checkpoint_budget)
            {
                self.log.append(LogRecord::EndCheckpoint {
                    dirty_pages: std::mem::take(&mut dirty_pages),
                    active_txns: std::mem::take(&mut active_txns),
                })?;
            }
            dirty_pages.insert(*item.key(), *item.value());
        }

        for item in self.txn_table.iter() {
            if !checkpoint_fits(dirty_pages.len(), active_txns.len() + 1, self.checkpoint_budget)
            {
                self.log.append(LogRecord::EndCheckpoint {
                    dirty_pages: std::mem::take(&mut dirty_pages),
                    active_txns: std::mem::take(&mut active_txns),
                })?;
            }
            active_txns.insert(
                *item.key(),
                (item.transaction.status(), item.last_lsn),
            );
        }

        // The final end record goes out even when empty.
        let end_lsn = self.log.append(LogRecord::EndCheckpoint {
            dirty_pages,
            active_txns,
        })?;

        self.log.flush_to(end_lsn)?;
        self.log.rewrite_master(LogRecord::Master {
            last_checkpoint_lsn: begin_lsn,
        })?;
        debug!(begin_lsn, end_lsn, "checkpoint complete");
        Ok(())
    }

    /// Final checkpoint, then close the log.
    pub fn close(&self) -> Result<()> {
        self.checkpoint()?;
        self.log.close()
    }

    // ========================================================================
    // Hooks from the buffer manager
    // ========================================================================

    /// WAL discipline: called before a dirty page is written out; forces
    /// the log through the page's LSN.
    pub fn page_flush_hook(&self, page_lsn: Lsn) -> Result<()> {
        self.log.flush_to(page_lsn)
    }

    /// Called after a page write reaches disk. Ignored until redo has
    /// finished so restart cannot lose DPT state it just rebuilt.
    pub fn disk_io_hook(&self, page_id: PageId) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.dirty_page_table.remove(&page_id);
        }
    }

    /// Records that `lsn` dirtied `page_id`. Keeps the minimum when racing
    /// inserts arrive out of order.
    pub fn dirty_page(&self, page_id: PageId, lsn: Lsn) {
        self.dirty_page_table
            .entry(page_id)
            .and_modify(|rec_lsn| *rec_lsn = (*rec_lsn).min(lsn))
            .or_insert(lsn);
    }

    // ========================================================================
    // Restart
    // ========================================================================

    /// Three-phase restart: analysis, redo, dirty-page-table cleanup,
    /// undo, then a terminal checkpoint. No transactions may start until
    /// this returns.
    pub fn restart(&self) -> Result<()> {
        info!("restart recovery: analysis");
        self.redo_complete.store(false, Ordering::SeqCst);
        self.restart_analysis()?;
        info!(
            transactions = self.txn_table.len(),
            dirty_pages = self.dirty_page_table.len(),
            "restart recovery: redo"
        );
        self.restart_redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dirty_page_table();
        info!("restart recovery: undo");
        self.restart_undo()?;
        self.checkpoint()?;
        info!("restart recovery complete");
        Ok(())
    }

    fn ensure_transaction(&self, txn_id: TransactionId) {
        self.txn_table
            .entry(txn_id)
            .or_insert_with(|| TransactionTableEntry::new((self.new_transaction)(txn_id)));
    }

    /// Rebuilds the transaction table and dirty page table by scanning
    /// forward from the last completed checkpoint.
    pub fn restart_analysis(&self) -> Result<()> {
        let master = self.log.fetch(NO_LSN)?;
        let LogRecord::Master { last_checkpoint_lsn } = master else {
            panic!("log record 0 is not a master record");
        };

        let mut ended: HashSet<TransactionId> = HashSet::new();

        for (lsn, record) in self.log.scan_from(last_checkpoint_lsn) {
            if let Some(txn_id) = record.txn_id() {
                self.ensure_transaction(txn_id);
                let mut entry = self.txn_table.get_mut(&txn_id).unwrap();
                if lsn > entry.last_lsn {
                    entry.last_lsn = lsn;
                }
            }

            if let Some(page_id) = record.page_id() {
                match record {
                    LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                        self.dirty_page_table.entry(page_id).or_insert(lsn);
                    }
                    // Disk is authoritative once the page is gone.
                    LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                        self.dirty_page_table.remove(&page_id);
                    }
                    _ => {}
                }
            }

            match &record {
                LogRecord::CommitTxn { txn_id, .. } => {
                    let entry = self.txn_table.get(txn_id).unwrap();
                    // A second restart may rescan its own appended records;
                    // only upgrade from Running.
                    if entry.transaction.status() == TransactionStatus::Running {
                        entry.transaction.set_status(TransactionStatus::Committing);
                    }
                }
                LogRecord::AbortTxn { txn_id, .. } => {
                    let entry = self.txn_table.get(txn_id).unwrap();
                    if entry.transaction.status() == TransactionStatus::Running {
                        entry
                            .transaction
                            .set_status(TransactionStatus::RecoveryAborting);
                    }
                }
                LogRecord::EndTxn { txn_id, .. } => {
                    let transaction = self
                        .txn_table
                        .get(txn_id)
                        .map(|entry| Arc::clone(&entry.transaction));
                    if let Some(transaction) = transaction {
                        transaction.cleanup();
                        transaction.set_status(TransactionStatus::Complete);
                        self.txn_table.remove(txn_id);
                    }
                    ended.insert(*txn_id);
                }
                LogRecord::EndCheckpoint {
                    dirty_pages,
                    active_txns,
                } => {
                    // Checkpointed rec_lsns are authoritative.
                    for (&page_id, &rec_lsn) in dirty_pages {
                        self.dirty_page_table.insert(page_id, rec_lsn);
                    }
                    for (&txn_id, &(status, last_lsn)) in active_txns {
                        if ended.contains(&txn_id) {
                            continue;
                        }
                        self.ensure_transaction(txn_id);
                        let mut entry = self.txn_table.get_mut(&txn_id).unwrap();
                        if last_lsn > entry.last_lsn {
                            entry.last_lsn = last_lsn;
                        }
                        if entry.transaction.status() == TransactionStatus::Running {
                            match status {
                                TransactionStatus::Aborting
                                | TransactionStatus::RecoveryAborting => entry
                                    .transaction
                                    .set_status(TransactionStatus::RecoveryAborting),
                                TransactionStatus::Committing => entry
                                    .transaction
                                    .set_status(TransactionStatus::Committing),
                                _ => {}
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Settle every surviving transaction: committed work gets its end
        // record, unfinished work is marked for rollback.
        let txn_ids: Vec<TransactionId> = self.txn_table.iter().map(|e| *e.key()).collect();
        for txn_id in txn_ids {
            let (transaction, last_lsn, status) = {
                let entry = self.txn_table.get(&txn_id).unwrap();
                (
                    Arc::clone(&entry.transaction),
                    entry.last_lsn,
                    entry.transaction.status(),
                )
            };
            match status {
                TransactionStatus::Committing => {
                    transaction.cleanup();
                    self.log.append(LogRecord::EndTxn {
                        txn_id,
                        prev_lsn: last_lsn,
                    })?;
                    transaction.set_status(TransactionStatus::Complete);
                    self.txn_table.remove(&txn_id);
                }
                TransactionStatus::Running => {
                    let lsn = self.log.append(LogRecord::AbortTxn {
                        txn_id,
                        prev_lsn: last_lsn,
                    })?;
                    transaction.set_status(TransactionStatus::RecoveryAborting);
                    self.txn_table.get_mut(&txn_id).unwrap().last_lsn = lsn;
                }
                TransactionStatus::RecoveryAborting => {}
                other => panic!(
                    "transaction {} in impossible status {} after analysis",
                    txn_id, other
                ),
            }
        }
        Ok(())
    }

    /// Replays history from the lowest rec_lsn in the dirty page table.
    /// Idempotent: a record only reaches a page whose page LSN is older.
    pub fn restart_redo(&self) -> Result<()> {
        let start = self.dirty_page_table.iter().map(|e| *e.value()).min();
        let Some(start) = start else {
            return Ok(());
        };

        let mut redone = 0u64;
        for (lsn, record) in self.log.scan_from(start) {
            if !record.is_redoable() {
                continue;
            }

            // Partition lifecycle and page allocation always replay; their
            // effects live in the disk layout, not in any page image.
            let always = matches!(
                record,
                LogRecord::AllocPart { .. }
                    | LogRecord::UndoAllocPart { .. }
                    | LogRecord::FreePart { .. }
                    | LogRecord::UndoFreePart { .. }
                    | LogRecord::AllocPage { .. }
                    | LogRecord::UndoFreePage { .. }
            );
            if always {
                record.redo(lsn, &self.disk, self.buffer())?;
                redone += 1;
                continue;
            }

            let page_id = record.page_id().expect("page-modifying record without page");
            let Some(rec_lsn) = self.dirty_page_table.get(&page_id).map(|e| *e.value()) else {
                continue;
            };
            if lsn < rec_lsn {
                continue;
            }

            let pinned = match self.buffer().fetch_page(page_id) {
                Ok(pinned) => pinned,
                Err(DbError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if pinned.page_lsn() < lsn {
                record.redo(lsn, &self.disk, self.buffer())?;
                redone += 1;
            }
            drop(pinned);
        }
        debug!(records = redone, "redo complete");
        Ok(())
    }

    /// Drops dirty-page-table entries for pages the buffer pool no longer
    /// considers dirty; analysis is deliberately conservative and leaves
    /// phantoms behind.
    pub fn clean_dirty_page_table(&self) {
        let mut actually_dirty: HashSet<PageId> = HashSet::new();
        self.buffer().iter_page_nums(|page_id, dirty| {
            if dirty {
                actually_dirty.insert(page_id);
            }
        });
        self.dirty_page_table
            .retain(|page_id, _| actually_dirty.contains(page_id));
    }

    /// Rolls back every transaction left in `RecoveryAborting`, working
    /// down a max-heap of last LSNs so undo proceeds in reverse LSN order
    /// across all transactions at once.
    pub fn restart_undo(&self) -> Result<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionId)> = self
            .txn_table
            .iter()
            .filter(|e| e.transaction.status() == TransactionStatus::RecoveryAborting)
            .map(|e| (e.last_lsn, *e.key()))
            .collect();

        while let Some((lsn, txn_id)) = heap.pop() {
            let record = self.log.fetch(lsn)?;

            if record.is_undoable() {
                let clr_prev = self.txn_table.get(&txn_id).unwrap().last_lsn;
                let clr = record.undo(clr_prev);
                let clr_lsn = self.log.append(clr.clone())?;
                self.txn_table.get_mut(&txn_id).unwrap().last_lsn = clr_lsn;
                clr.redo(clr_lsn, &self.disk, self.buffer())?;
            }

            let next = record
                .undo_next_lsn()
                .or(record.prev_lsn())
                .unwrap_or(NO_LSN);
            if next == NO_LSN {
                let (transaction, last_lsn) = {
                    let entry = self.txn_table.get(&txn_id).unwrap();
                    (Arc::clone(&entry.transaction), entry.last_lsn)
                };
                transaction.cleanup();
                transaction.set_status(TransactionStatus::Complete);
                self.log.append(LogRecord::EndTxn {
                    txn_id,
                    prev_lsn: last_lsn,
                })?;
                self.txn_table.remove(&txn_id);
            } else {
                heap.push((next, txn_id));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn dirty_page_table_snapshot(&self) -> BTreeMap<PageId, Lsn> {
        self.dirty_page_table
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    pub fn transaction_table_snapshot(
        &self,
    ) -> BTreeMap<TransactionId, (TransactionStatus, Lsn)> {
        self.txn_table
            .iter()
            .map(|e| (*e.key(), (e.transaction.status(), e.last_lsn)))
            .collect()
    }

    pub fn last_lsn_of(&self, txn_id: TransactionId) -> Option<Lsn> {
        self.txn_table.get(&txn_id).map(|e| e.last_lsn)
    }

    pub fn touched_pages_of(&self, txn_id: TransactionId) -> Option<BTreeSet<PageId>> {
        self.txn_table.get(&txn_id).map(|e| e.touched_pages.clone())
    }
}
