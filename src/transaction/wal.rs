// Write-Ahead Logging
//
// ARIES-style logging with a buffered append path and group commit. The
// on-disk stream is a sequence of framed records:
//
//   { length u32 | type u8 | txn_id u32 | prev_lsn u64 | page_id u32 |
//     payload[length-21] | crc32 u32 }
//
// `length` counts everything after itself (type through crc). The LSN of a
// record is the byte offset of its frame in the log file. A failed log
// write engages panic mode: the engine stays up for reads but refuses all
// further writes.

use crate::common::{Lsn, PageId, SlotId, TransactionId, WAL_BUFFER_SIZE};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Fixed part of a frame after the length field: type + txn_id + prev_lsn +
/// page_id.
const FRAME_FIXED: usize = 1 + 4 + 8 + 4;

/// File magic. Keeps record offsets strictly positive, so LSN 0 can serve
/// as the "no record" sentinel.
const WAL_MAGIC: &[u8; 8] = b"LDBWAL01";

/// Redo action carried by a compensation log record. CLRs are redo-only and
/// are never undone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClrAction {
    /// Undo of an insert: tombstone the slot again.
    UndoInsert { slot: SlotId },
    /// Undo of a delete: restore the old bytes into the slot.
    UndoDelete { slot: SlotId, data: Vec<u8> },
    /// Undo of an in-place update: restore the old image.
    UndoUpdate { slot: SlotId, old: Vec<u8> },
}

/// Log record payloads, a closed tagged set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogPayload {
    Begin,
    Commit,
    Abort,
    Insert {
        slot: SlotId,
        data: Vec<u8>,
    },
    Delete {
        slot: SlotId,
        old: Vec<u8>,
    },
    Update {
        slot: SlotId,
        old: Vec<u8>,
        new: Vec<u8>,
    },
    NewPage {
        prev_page: PageId,
    },
    Clr {
        undo_next_lsn: Lsn,
        action: ClrAction,
    },
    CheckpointBegin {
        /// Active transaction table: txn_id -> lastLSN.
        att: Vec<(TransactionId, Lsn)>,
        /// Dirty page table: page_id -> recoveryLSN.
        dpt: Vec<(PageId, Lsn)>,
    },
    CheckpointEnd,
}

impl LogPayload {
    /// Wire type byte.
    pub fn type_code(&self) -> u8 {
        match self {
            LogPayload::Begin => 1,
            LogPayload::Commit => 2,
            LogPayload::Abort => 3,
            LogPayload::Insert { .. } => 4,
            LogPayload::Delete { .. } => 5,
            LogPayload::Update { .. } => 6,
            LogPayload::NewPage { .. } => 7,
            LogPayload::Clr { .. } => 8,
            LogPayload::CheckpointBegin { .. } => 9,
            LogPayload::CheckpointEnd => 10,
        }
    }
}

/// One decoded log record with its position.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub prev_lsn: Lsn,
    pub page_id: PageId,
    pub payload: LogPayload,
}

struct WalBuffer {
    /// Encoded frames not yet on disk.
    bytes: Vec<u8>,
    /// File offset of the first buffered byte.
    base: Lsn,
}

/// Append-only log manager with group commit.
pub struct WalManager {
    path: PathBuf,
    file: Mutex<File>,
    buffer: Mutex<WalBuffer>,
    /// Offset after the last durably flushed byte.
    flushed_lsn: AtomicU64,
    panicked: AtomicBool,
}

impl WalManager {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut len = file.metadata()?.len();
        if len < WAL_MAGIC.len() as u64 {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(WAL_MAGIC)?;
            file.sync_data()?;
            len = WAL_MAGIC.len() as u64;
        } else {
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if &magic != WAL_MAGIC {
                return Err(DbError::Recovery(format!(
                    "{} is not a LatticeDB log file",
                    path.display()
                )));
            }
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
            buffer: Mutex::new(WalBuffer {
                bytes: Vec::with_capacity(WAL_BUFFER_SIZE),
                base: len,
            }),
            flushed_lsn: AtomicU64::new(len),
            panicked: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once a log write has failed; every later append is refused.
    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::SeqCst)
    }

    /// Offset after the last durable byte.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// Appends one record to the log buffer and returns its LSN. The
    /// buffer drains to disk once it holds more than 1 MiB.
    pub fn append(
        &self,
        txn_id: TransactionId,
        prev_lsn: Lsn,
        page_id: PageId,
        payload: LogPayload,
    ) -> Result<Lsn> {
        if self.is_panicked() {
            return Err(DbError::Wal("log is in panic mode".to_string()));
        }
        let body = bincode::serde::encode_to_vec(&payload, bincode::config::standard())?;
        let mut buffer = self.buffer.lock();
        let lsn = buffer.base + buffer.bytes.len() as u64;

        let length = (FRAME_FIXED + body.len() + 4) as u32;
        let start = buffer.bytes.len();
        buffer.bytes.extend_from_slice(&length.to_le_bytes());
        buffer.bytes.push(payload.type_code());
        buffer.bytes.extend_from_slice(&txn_id.to_le_bytes());
        buffer.bytes.extend_from_slice(&prev_lsn.to_le_bytes());
        buffer.bytes.extend_from_slice(&page_id.to_le_bytes());
        buffer.bytes.extend_from_slice(&body);
        let crc = crc32fast::hash(&buffer.bytes[start + 4..]);
        buffer.bytes.extend_from_slice(&crc.to_le_bytes());

        if buffer.bytes.len() >= WAL_BUFFER_SIZE {
            self.flush_locked(&mut buffer)?;
        }
        Ok(lsn)
    }

    /// Forces every record with LSN <= `up_to` to disk. Committers that
    /// arrive while another flush holds the buffer lock find their records
    /// already durable when they get it — that is the group commit.
    pub fn flush(&self, up_to: Lsn) -> Result<()> {
        if self.flushed_lsn() > up_to {
            return Ok(());
        }
        let mut buffer = self.buffer.lock();
        if self.flushed_lsn() > up_to {
            return Ok(());
        }
        self.flush_locked(&mut buffer)
    }

    /// Drains the whole buffer.
    pub fn flush_all(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut WalBuffer) -> Result<()> {
        if buffer.bytes.is_empty() {
            return Ok(());
        }
        let result = (|| -> Result<()> {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(buffer.base))?;
            file.write_all(&buffer.bytes)?;
            file.sync_data()?;
            Ok(())
        })();
        if let Err(e) = result {
            self.panicked.store(true, Ordering::SeqCst);
            tracing::error!("WAL flush failed, engaging panic mode: {}", e);
            return Err(e);
        }
        buffer.base += buffer.bytes.len() as u64;
        buffer.bytes.clear();
        self.flushed_lsn.store(buffer.base, Ordering::SeqCst);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read path (recovery)
    // ------------------------------------------------------------------

    /// Reads and decodes the entire durable log. Corrupt or torn tails are
    /// cut off at the last valid record.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let bytes = {
            let mut file = self.file.lock();
            let mut bytes = Vec::new();
            file.seek(SeekFrom::Start(0))?;
            file.read_to_end(&mut bytes)?;
            bytes
        };
        let mut records = Vec::new();
        let mut offset = WAL_MAGIC.len();
        while offset + 4 <= bytes.len() {
            match Self::decode_frame(&bytes, offset) {
                Ok(Some((record, next))) => {
                    records.push(record);
                    offset = next;
                }
                Ok(None) | Err(_) => break,
            }
        }
        Ok(records)
    }

    /// Random-access read of one record, used by the undo pass to walk
    /// `prev_lsn` chains.
    pub fn read_record_at(&self, lsn: Lsn) -> Result<LogRecord> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(lsn))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let length = u32::from_le_bytes(len_buf) as usize;
        let mut rest = vec![0u8; length];
        file.read_exact(&mut rest)?;
        drop(file);
        let mut frame = len_buf.to_vec();
        frame.extend_from_slice(&rest);
        match Self::decode_frame(&frame, 0)? {
            Some((mut record, _)) => {
                record.lsn = lsn;
                Ok(record)
            }
            None => Err(DbError::Recovery(format!("no record at LSN {}", lsn))),
        }
    }

    fn decode_frame(bytes: &[u8], offset: usize) -> Result<Option<(LogRecord, usize)>> {
        if offset + 4 > bytes.len() {
            return Ok(None);
        }
        let length =
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        if length < FRAME_FIXED + 4 || offset + 4 + length > bytes.len() {
            return Ok(None);
        }
        let frame = &bytes[offset + 4..offset + 4 + length];
        let (body, crc_bytes) = frame.split_at(length - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if crc32fast::hash(body) != stored_crc {
            return Err(DbError::Recovery(format!(
                "CRC mismatch in log record at offset {}",
                offset
            )));
        }
        let txn_id = u32::from_le_bytes(body[1..5].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(body[5..13].try_into().unwrap());
        let page_id = u32::from_le_bytes(body[13..17].try_into().unwrap());
        let (payload, _) = bincode::serde::decode_from_slice::<LogPayload, _>(
            &body[FRAME_FIXED..],
            bincode::config::standard(),
        )?;
        Ok(Some((
            LogRecord {
                lsn: offset as u64,
                txn_id,
                prev_lsn,
                page_id,
                payload,
            },
            offset + 4 + length,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_flush_read_roundtrip() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path().join("wal.log")).unwrap();

        let l1 = wal.append(1, 0, 0, LogPayload::Begin).unwrap();
        let l2 = wal
            .append(
                1,
                l1,
                5,
                LogPayload::Insert {
                    slot: 0,
                    data: vec![1, 2, 3],
                },
            )
            .unwrap();
        let l3 = wal.append(1, l2, 0, LogPayload::Commit).unwrap();
        wal.flush(l3).unwrap();

        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].payload, LogPayload::Begin);
        assert_eq!(records[1].prev_lsn, l1);
        assert_eq!(records[1].page_id, 5);
        assert_eq!(records[2].payload, LogPayload::Commit);
        assert!(wal.flushed_lsn() > l3);
    }

    #[test]
    fn test_flush_is_idempotent_for_covered_lsns() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path().join("wal.log")).unwrap();
        let lsn = wal.append(1, 0, 0, LogPayload::Begin).unwrap();
        wal.flush(lsn).unwrap();
        let flushed = wal.flushed_lsn();
        wal.flush(lsn).unwrap();
        assert_eq!(wal.flushed_lsn(), flushed);
    }

    #[test]
    fn test_random_access_read() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(dir.path().join("wal.log")).unwrap();
        let _ = wal.append(7, 0, 0, LogPayload::Begin).unwrap();
        let target = wal
            .append(
                7,
                0,
                3,
                LogPayload::Delete {
                    slot: 2,
                    old: vec![9, 9],
                },
            )
            .unwrap();
        wal.flush_all().unwrap();

        let record = wal.read_record_at(target).unwrap();
        assert_eq!(record.txn_id, 7);
        assert_eq!(
            record.payload,
            LogPayload::Delete {
                slot: 2,
                old: vec![9, 9]
            }
        );
    }

    #[test]
    fn test_reopen_appends_after_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = WalManager::open(&path).unwrap();
            wal.append(1, 0, 0, LogPayload::Begin).unwrap();
            wal.flush_all().unwrap();
        }
        let wal = WalManager::open(&path).unwrap();
        wal.append(2, 0, 0, LogPayload::Begin).unwrap();
        wal.flush_all().unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].txn_id, 2);
    }
}
