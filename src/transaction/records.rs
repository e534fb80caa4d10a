// ARIES log records as a tagged union.
//
// Every variant that belongs to a transaction chains backwards through
// `prev_lsn` (0 = start of the chain). Compensation records additionally
// carry `undo_next_lsn`, the next LSN rollback must visit, which is what
// stops a restarted rollback from re-undoing finished work.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{Lsn, PageId, PartitionId, TransactionId};
use crate::error::{DbError, Result};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::disk::DiskSpaceManager;

use super::types::TransactionStatus;

/// Serialized size charged per dirty-page entry in an end-checkpoint record.
pub const DPT_ENTRY_BYTES: usize = 16;

/// Serialized size charged per transaction-table entry in an end-checkpoint
/// record.
pub const TXN_ENTRY_BYTES: usize = 24;

/// Whether an end-checkpoint record with the given entry counts stays
/// within `budget` payload bytes.
pub fn checkpoint_fits(n_dirty_pages: usize, n_txns: usize, budget: usize) -> bool {
    n_dirty_pages * DPT_ENTRY_BYTES + n_txns * TXN_ENTRY_BYTES <= budget
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    /// Always at LSN 0; points at the begin record of the most recent
    /// completed checkpoint.
    Master { last_checkpoint_lsn: Lsn },

    /// A byte-range overwrite on a page. Undoable and redoable.
    UpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },

    /// CLR for `UpdatePage`: restores the before-image. Redo-only.
    UndoUpdatePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        offset: u16,
        after: Vec<u8>,
        undo_next_lsn: Lsn,
    },

    AllocPage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
    },

    UndoAllocPage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        undo_next_lsn: Lsn,
    },

    FreePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
    },

    UndoFreePage {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        undo_next_lsn: Lsn,
    },

    AllocPart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        partition: PartitionId,
    },

    UndoAllocPart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        partition: PartitionId,
        undo_next_lsn: Lsn,
    },

    FreePart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        partition: PartitionId,
    },

    UndoFreePart {
        txn_id: TransactionId,
        prev_lsn: Lsn,
        partition: PartitionId,
        undo_next_lsn: Lsn,
    },

    CommitTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },

    AbortTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },

    EndTxn {
        txn_id: TransactionId,
        prev_lsn: Lsn,
    },

    BeginCheckpoint,

    /// Snapshot chunk of the dirty page table and transaction table; a
    /// checkpoint emits as many of these as its entry budget requires.
    EndCheckpoint {
        dirty_pages: BTreeMap<PageId, Lsn>,
        active_txns: BTreeMap<TransactionId, (TransactionStatus, Lsn)>,
    },
}

impl LogRecord {
    pub fn txn_id(&self) -> Option<TransactionId> {
        match self {
            LogRecord::UpdatePage { txn_id, .. }
            | LogRecord::UndoUpdatePage { txn_id, .. }
            | LogRecord::AllocPage { txn_id, .. }
            | LogRecord::UndoAllocPage { txn_id, .. }
            | LogRecord::FreePage { txn_id, .. }
            | LogRecord::UndoFreePage { txn_id, .. }
            | LogRecord::AllocPart { txn_id, .. }
            | LogRecord::UndoAllocPart { txn_id, .. }
            | LogRecord::FreePart { txn_id, .. }
            | LogRecord::UndoFreePart { txn_id, .. }
            | LogRecord::CommitTxn { txn_id, .. }
            | LogRecord::AbortTxn { txn_id, .. }
            | LogRecord::EndTxn { txn_id, .. } => Some(*txn_id),
            _ => None,
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::UpdatePage { prev_lsn, .. }
            | LogRecord::UndoUpdatePage { prev_lsn, .. }
            | LogRecord::AllocPage { prev_lsn, .. }
            | LogRecord::UndoAllocPage { prev_lsn, .. }
            | LogRecord::FreePage { prev_lsn, .. }
            | LogRecord::UndoFreePage { prev_lsn, .. }
            | LogRecord::AllocPart { prev_lsn, .. }
            | LogRecord::UndoAllocPart { prev_lsn, .. }
            | LogRecord::FreePart { prev_lsn, .. }
            | LogRecord::UndoFreePart { prev_lsn, .. }
            | LogRecord::CommitTxn { prev_lsn, .. }
            | LogRecord::AbortTxn { prev_lsn, .. }
            | LogRecord::EndTxn { prev_lsn, .. } => Some(*prev_lsn),
            _ => None,
        }
    }

    pub fn page_id(&self) -> Option<PageId> {
        match self {
            LogRecord::UpdatePage { page_id, .. }
            | LogRecord::UndoUpdatePage { page_id, .. }
            | LogRecord::AllocPage { page_id, .. }
            | LogRecord::UndoAllocPage { page_id, .. }
            | LogRecord::FreePage { page_id, .. }
            | LogRecord::UndoFreePage { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    pub fn partition(&self) -> Option<PartitionId> {
        match self {
            LogRecord::AllocPart { partition, .. }
            | LogRecord::UndoAllocPart { partition, .. }
            | LogRecord::FreePart { partition, .. }
            | LogRecord::UndoFreePart { partition, .. } => Some(*partition),
            _ => None,
        }
    }

    /// Only compensation records have one.
    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        match self {
            LogRecord::UndoUpdatePage { undo_next_lsn, .. }
            | LogRecord::UndoAllocPage { undo_next_lsn, .. }
            | LogRecord::UndoFreePage { undo_next_lsn, .. }
            | LogRecord::UndoAllocPart { undo_next_lsn, .. }
            | LogRecord::UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn is_undoable(&self) -> bool {
        matches!(
            self,
            LogRecord::UpdatePage { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::FreePage { .. }
                | LogRecord::AllocPart { .. }
                | LogRecord::FreePart { .. }
        )
    }

    pub fn is_redoable(&self) -> bool {
        matches!(
            self,
            LogRecord::UpdatePage { .. }
                | LogRecord::UndoUpdatePage { .. }
                | LogRecord::AllocPage { .. }
                | LogRecord::UndoAllocPage { .. }
                | LogRecord::FreePage { .. }
                | LogRecord::UndoFreePage { .. }
                | LogRecord::AllocPart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoFreePart { .. }
        )
    }

    /// Builds the compensation record that reverses this record.
    ///
    /// `clr_prev_lsn` becomes the CLR's `prev_lsn` (the issuing
    /// transaction's current last LSN); the CLR's `undo_next_lsn` is this
    /// record's `prev_lsn`, so rollback resumes behind it.
    ///
    /// # Panics
    ///
    /// Panics when called on a record that is not undoable.
    pub fn undo(&self, clr_prev_lsn: Lsn) -> LogRecord {
        match self {
            LogRecord::UpdatePage {
                txn_id,
                prev_lsn,
                page_id,
                offset,
                before,
                ..
            } => LogRecord::UndoUpdatePage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                page_id: *page_id,
                offset: *offset,
                after: before.clone(),
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::AllocPage {
                txn_id,
                prev_lsn,
                page_id,
            } => LogRecord::UndoAllocPage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                page_id: *page_id,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::FreePage {
                txn_id,
                prev_lsn,
                page_id,
            } => LogRecord::UndoFreePage {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                page_id: *page_id,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::AllocPart {
                txn_id,
                prev_lsn,
                partition,
            } => LogRecord::UndoAllocPart {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                partition: *partition,
                undo_next_lsn: *prev_lsn,
            },
            LogRecord::FreePart {
                txn_id,
                prev_lsn,
                partition,
            } => LogRecord::UndoFreePart {
                txn_id: *txn_id,
                prev_lsn: clr_prev_lsn,
                partition: *partition,
                undo_next_lsn: *prev_lsn,
            },
            other => panic!("undo called on non-undoable record {:?}", other),
        }
    }

    /// Re-applies this record's effect. `lsn` is the record's own LSN and
    /// is stamped onto any page it touches. Page lifecycle replays are
    /// idempotent: an allocation that already exists (or a free of a page
    /// already gone) is a no-op.
    ///
    /// # Panics
    ///
    /// Panics when called on a record that is not redoable.
    pub fn redo(
        &self,
        lsn: Lsn,
        disk: &DiskSpaceManager,
        buffer: &BufferPoolManager,
    ) -> Result<()> {
        match self {
            LogRecord::UpdatePage {
                page_id,
                offset,
                after,
                ..
            }
            | LogRecord::UndoUpdatePage {
                page_id,
                offset,
                after,
                ..
            } => buffer.apply_redo_write(*page_id, *offset, after, lsn),

            LogRecord::AllocPage { page_id, .. } | LogRecord::UndoFreePage { page_id, .. } => {
                match disk.alloc_page(*page_id) {
                    Ok(_) | Err(DbError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            LogRecord::FreePage { page_id, .. } | LogRecord::UndoAllocPage { page_id, .. } => {
                buffer.discard_page(*page_id);
                match disk.free_page(*page_id) {
                    Ok(()) | Err(DbError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            LogRecord::AllocPart { partition, .. } | LogRecord::UndoFreePart { partition, .. } => {
                match disk.alloc_part(*partition) {
                    Ok(_) | Err(DbError::AlreadyExists(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            LogRecord::FreePart { partition, .. } | LogRecord::UndoAllocPart { partition, .. } => {
                match disk.free_part(*partition) {
                    Ok(()) | Err(DbError::NotFound(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }

            other => panic!("redo called on non-redoable record {:?}", other),
        }
    }
}
