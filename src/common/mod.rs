// Shared identifiers and storage geometry.
//
// Every subsystem speaks in terms of these aliases; keeping them in one
// place is what lets the recovery and lock managers agree on transaction
// identity without depending on each other.

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions.
pub type TransactionId = u64;

/// Unique identifier for pages. The high 32 bits encode the partition,
/// the low 32 bits the page index within that partition.
pub type PageId = u64;

/// Unique identifier for disk partitions.
pub type PartitionId = u32;

/// Log Sequence Number: a total order over log records.
pub type Lsn = u64;

// ============================================================================
// Storage geometry
// ============================================================================

/// Raw size of a page on disk.
pub const PAGE_SIZE: usize = 4096;

/// Bytes at the end of every page reserved for the page LSN.
pub const PAGE_LSN_BYTES: usize = 8;

/// Usable bytes per page once the page LSN footer is accounted for.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - PAGE_LSN_BYTES;

/// Partition reserved for the write-ahead log itself.
pub const LOG_PARTITION: PartitionId = 0;

/// Sentinel LSN meaning "no record". LSN 0 itself addresses the master
/// record, which no chain ever points at, so the two uses cannot collide.
pub const NO_LSN: Lsn = 0;

/// Builds a page id from a partition number and a page index.
#[inline]
pub fn make_page_id(partition: PartitionId, index: u32) -> PageId {
    ((partition as u64) << 32) | index as u64
}

/// Extracts the partition number from a page id.
#[inline]
pub fn partition_of(page_id: PageId) -> PartitionId {
    (page_id >> 32) as PartitionId
}

/// Extracts the page index within its partition.
#[inline]
pub fn page_index(page_id: PageId) -> u32 {
    (page_id & 0xFFFF_FFFF) as u32
}
