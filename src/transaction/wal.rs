// Append-only log manager.
//
// On-disk layout: a fixed 64-byte slot for the master record (LSN 0),
// followed by framed records. Each frame is `[len: u32][crc32: u32][bincode
// payload]`. LSNs are assigned densely in append order, so a record's LSN
// doubles as its index in the in-memory mirror.
//
// Appends are buffered; nothing is durable until `flush_to` (or `close`)
// writes and syncs. `flushed_lsn` is the watermark the WAL discipline is
// built on: a page may only reach disk once `flushed_lsn` covers its
// page LSN. Reopening a log replays frames from disk and truncates a torn
// tail at the first bad length or checksum.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::common::{Lsn, PAGE_SIZE};
use crate::error::{DbError, Result};

use super::records::LogRecord;

const MASTER_SLOT_BYTES: usize = 64;
const FRAME_HEADER_BYTES: usize = 8;
const MAX_FRAME_BYTES: usize = 2 * PAGE_SIZE;

struct LogInner {
    file: File,
    records: Vec<LogRecord>,
    /// Encoded frames appended since the last sync.
    pending: Vec<u8>,
}

pub struct LogManager {
    inner: Mutex<LogInner>,
    flushed_lsn: AtomicU64,
}

impl LogManager {
    /// Opens (or creates) the log at `path`, replaying any existing frames.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let mut records = Vec::new();
        let file_len = file.metadata()?.len();

        if file_len >= MASTER_SLOT_BYTES as u64 {
            let mut slot = [0u8; MASTER_SLOT_BYTES];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut slot)?;
            let master = decode_frame(&slot)?.ok_or_else(|| {
                DbError::Corruption("master record slot is unreadable".to_string())
            })?;
            if !matches!(master, LogRecord::Master { .. }) {
                return Err(DbError::Corruption(
                    "log does not start with a master record".to_string(),
                ));
            }
            records.push(master);

            let mut good_end = MASTER_SLOT_BYTES as u64;
            let mut rest = Vec::new();
            file.read_to_end(&mut rest)?;
            let mut cursor = 0usize;
            loop {
                match decode_frame(&rest[cursor..]) {
                    Ok(Some(record)) => {
                        let len =
                            u32::from_le_bytes(rest[cursor..cursor + 4].try_into().unwrap());
                        cursor += FRAME_HEADER_BYTES + len as usize;
                        good_end = MASTER_SLOT_BYTES as u64 + cursor as u64;
                        records.push(record);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(
                            offset = good_end,
                            "truncating torn tail of write-ahead log"
                        );
                        break;
                    }
                }
            }
            if good_end < file_len {
                file.set_len(good_end)?;
            }
        } else if file_len > 0 {
            // Shorter than the master slot: nothing recoverable was written.
            file.set_len(0)?;
        }

        let flushed = records.len().saturating_sub(1) as Lsn;
        Ok(Self {
            inner: Mutex::new(LogInner {
                file,
                records,
                pending: Vec::new(),
            }),
            flushed_lsn: AtomicU64::new(flushed),
        })
    }

    /// Appends a record and returns its LSN.
    ///
    /// The very first record appended to a fresh log must be the master
    /// record; it is written and synced immediately. Everything else stays
    /// buffered until `flush_to`.
    pub fn append(&self, record: LogRecord) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.records.len() as Lsn;

        if lsn == 0 {
            assert!(
                matches!(record, LogRecord::Master { .. }),
                "first log record must be the master record"
            );
            write_master_slot(&mut inner.file, &record)?;
            inner.records.push(record);
            self.flushed_lsn.store(0, Ordering::SeqCst);
            return Ok(0);
        }

        let frame = encode_frame(&record)?;
        inner.pending.extend_from_slice(&frame);
        inner.records.push(record);
        Ok(lsn)
    }

    /// Fetches the record at `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> Result<LogRecord> {
        self.inner
            .lock()
            .records
            .get(lsn as usize)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("log record {}", lsn)))
    }

    /// Lazy forward scan starting at `lsn`, bounded by the log end at the
    /// time of the call.
    pub fn scan_from(&self, lsn: Lsn) -> LogScan<'_> {
        let end = self.inner.lock().records.len() as Lsn;
        LogScan {
            log: self,
            next: lsn,
            end,
        }
    }

    /// Makes every record up to at least `lsn` durable.
    pub fn flush_to(&self, lsn: Lsn) -> Result<()> {
        if lsn <= self.flushed_lsn.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if inner.records.is_empty() {
            return Ok(());
        }
        let highest = inner.records.len() as Lsn - 1;
        if !inner.pending.is_empty() {
            let pending = std::mem::take(&mut inner.pending);
            inner.file.seek(SeekFrom::End(0))?;
            inner.file.write_all(&pending)?;
            inner.file.sync_all()?;
        }
        self.flushed_lsn.store(highest, Ordering::SeqCst);
        Ok(())
    }

    /// Highest LSN known to be durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// LSN of the most recently appended record, if any.
    pub fn last_lsn(&self) -> Option<Lsn> {
        let inner = self.inner.lock();
        inner.records.len().checked_sub(1).map(|i| i as Lsn)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Replaces the master record in its fixed slot and syncs.
    pub fn rewrite_master(&self, record: LogRecord) -> Result<()> {
        assert!(
            matches!(record, LogRecord::Master { .. }),
            "rewrite_master requires a master record"
        );
        let mut inner = self.inner.lock();
        assert!(!inner.records.is_empty(), "log has no master record yet");
        write_master_slot(&mut inner.file, &record)?;
        inner.records[0] = record;
        Ok(())
    }

    /// Flushes everything outstanding and syncs the file.
    pub fn close(&self) -> Result<()> {
        if let Some(last) = self.last_lsn() {
            self.flush_to(last)?;
        }
        Ok(())
    }
}

/// Pull-based iterator over log records; forward-only, non-restartable.
pub struct LogScan<'a> {
    log: &'a LogManager,
    next: Lsn,
    end: Lsn,
}

impl Iterator for LogScan<'_> {
    type Item = (Lsn, LogRecord);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let lsn = self.next;
        self.next += 1;
        let record = self.log.inner.lock().records.get(lsn as usize).cloned()?;
        Some((lsn, record))
    }
}

fn encode_frame(record: &LogRecord) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(record).map_err(|e| DbError::Serialization(e.to_string()))?;
    assert!(
        payload.len() <= MAX_FRAME_BYTES - FRAME_HEADER_BYTES,
        "log record exceeds maximum frame size"
    );
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one frame from the front of `bytes`. `Ok(None)` means a clean
/// end of data; `Err` means a torn or corrupt frame.
fn decode_frame(bytes: &[u8]) -> Result<Option<LogRecord>> {
    if bytes.len() < FRAME_HEADER_BYTES {
        return Ok(None);
    }
    let len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_BYTES || bytes.len() < FRAME_HEADER_BYTES + len {
        return Err(DbError::Corruption("truncated log frame".to_string()));
    }
    let crc = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let payload = &bytes[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + len];
    if crc32fast::hash(payload) != crc {
        return Err(DbError::Corruption("log frame checksum mismatch".to_string()));
    }
    let record =
        bincode::deserialize(payload).map_err(|e| DbError::Corruption(e.to_string()))?;
    Ok(Some(record))
}

fn write_master_slot(file: &mut File, record: &LogRecord) -> Result<()> {
    let frame = encode_frame(record)?;
    assert!(
        frame.len() <= MASTER_SLOT_BYTES,
        "master record does not fit its slot"
    );
    let mut slot = [0u8; MASTER_SLOT_BYTES];
    slot[..frame.len()].copy_from_slice(&frame);
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&slot)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn commit(txn_id: u64, prev_lsn: Lsn) -> LogRecord {
        LogRecord::CommitTxn { txn_id, prev_lsn }
    }

    #[test]
    fn test_append_assigns_dense_lsns() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("wal")).unwrap();

        assert_eq!(
            log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap(),
            0
        );
        assert_eq!(log.append(commit(1, 0)).unwrap(), 1);
        assert_eq!(log.append(commit(2, 0)).unwrap(), 2);
        assert_eq!(log.last_lsn(), Some(2));
    }

    #[test]
    #[should_panic(expected = "first log record must be the master record")]
    fn test_first_record_must_be_master() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("wal")).unwrap();
        let _ = log.append(commit(1, 0));
    }

    #[test]
    fn test_flush_watermark() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("wal")).unwrap();
        log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap();
        let l1 = log.append(commit(1, 0)).unwrap();
        let l2 = log.append(commit(2, 0)).unwrap();

        assert_eq!(log.flushed_lsn(), 0);
        log.flush_to(l1).unwrap();
        // Flushing is all-or-nothing over the buffered suffix.
        assert!(log.flushed_lsn() >= l2);
    }

    #[test]
    fn test_reopen_sees_only_flushed_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        let flushed_through;
        {
            let log = LogManager::open(&path).unwrap();
            log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap();
            let l1 = log.append(commit(1, 0)).unwrap();
            log.flush_to(l1).unwrap();
            flushed_through = l1;
            // Appended but never flushed; lost at "crash".
            log.append(commit(2, 0)).unwrap();
        }

        let log = LogManager::open(&path).unwrap();
        assert_eq!(log.last_lsn(), Some(flushed_through));
        assert_eq!(log.fetch(flushed_through).unwrap(), commit(1, 0));
    }

    #[test]
    fn test_reopen_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        {
            let log = LogManager::open(&path).unwrap();
            log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap();
            let l1 = log.append(commit(1, 0)).unwrap();
            log.flush_to(l1).unwrap();
        }
        // Corrupt the tail by chopping bytes off the last frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let log = LogManager::open(&path).unwrap();
        assert_eq!(log.last_lsn(), Some(0));
        assert!(matches!(log.fetch(0).unwrap(), LogRecord::Master { .. }));
    }

    #[test]
    fn test_rewrite_master_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal");

        {
            let log = LogManager::open(&path).unwrap();
            log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap();
            let l1 = log.append(LogRecord::BeginCheckpoint).unwrap();
            log.flush_to(l1).unwrap();
            log.rewrite_master(LogRecord::Master { last_checkpoint_lsn: l1 })
                .unwrap();
        }

        let log = LogManager::open(&path).unwrap();
        assert_eq!(
            log.fetch(0).unwrap(),
            LogRecord::Master { last_checkpoint_lsn: 1 }
        );
    }

    #[test]
    fn test_scan_is_bounded_and_ordered() {
        let dir = tempdir().unwrap();
        let log = LogManager::open(dir.path().join("wal")).unwrap();
        log.append(LogRecord::Master { last_checkpoint_lsn: 0 }).unwrap();
        for i in 1..=5 {
            log.append(commit(i, 0)).unwrap();
        }

        let scanned: Vec<Lsn> = log.scan_from(2).map(|(lsn, _)| lsn).collect();
        assert_eq!(scanned, vec![2, 3, 4, 5]);
    }
}
