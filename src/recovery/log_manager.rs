//! `LogManager` (spec.md §4.6, §6): an append-only log written through
//! the `BufferManager`'s pages in the reserved log partition, with LSN 0
//! permanently holding the master record.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferManager, EFFECTIVE_PAGE_SIZE};
use crate::codec::{Decode, Encode};
use crate::error::{RecoveryError, RecoveryResult};

use super::record::{Lsn, LogRecord};

/// tag(1) + lsn(8) + last_checkpoint_begin_lsn(8).
const MASTER_RECORD_BYTES: u64 = 17;

fn page_and_offset(global: u64) -> (u64, usize) {
    (global / EFFECTIVE_PAGE_SIZE as u64, (global % EFFECTIVE_PAGE_SIZE as u64) as usize)
}

fn write_bytes_at(buffer: &BufferManager, mut global_offset: u64, mut data: &[u8]) {
    while !data.is_empty() {
        let (page_num, offset) = page_and_offset(global_offset);
        let page = buffer.fetch_page(page_num);
        let room = EFFECTIVE_PAGE_SIZE - offset;
        let chunk = room.min(data.len());
        page.write(offset, &data[..chunk]);
        data = &data[chunk..];
        global_offset += chunk as u64;
    }
}

/// Reads the log's logical byte stream back out of buffer-manager pages,
/// transparently crossing page boundaries for records that straddle two
/// pages.
struct LogByteReader<'a> {
    buffer: &'a BufferManager,
    pos: u64,
}

impl<'a> Read for LogByteReader<'a> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let (page_num, offset) = page_and_offset(self.pos);
        let page = self.buffer.fetch_page(page_num);
        let room = EFFECTIVE_PAGE_SIZE - offset;
        let chunk = room.min(out.len());
        let bytes = page.read(offset, chunk);
        out[..chunk].copy_from_slice(&bytes);
        self.pos += chunk as u64;
        Ok(chunk)
    }
}

struct Inner {
    next_lsn: Lsn,
    durable_lsn: Lsn,
    write_offset: u64,
    /// LSN -> byte offset of the encoded record, for `fetch`/`scan_from`.
    index: BTreeMap<Lsn, u64>,
}

pub struct LogManager {
    buffer: Arc<BufferManager>,
    inner: Mutex<Inner>,
}

impl LogManager {
    pub fn new(buffer: Arc<BufferManager>) -> Self {
        let manager = Self {
            buffer,
            inner: Mutex::new(Inner {
                next_lsn: 1,
                durable_lsn: 0,
                write_offset: MASTER_RECORD_BYTES,
                index: BTreeMap::new(),
            }),
        };
        manager.write_master_bytes(0);
        manager
    }

    fn write_master_bytes(&self, last_checkpoint_begin_lsn: Lsn) {
        let record = LogRecord::Master { lsn: 0, last_checkpoint_begin_lsn };
        let mut buf = vec![];
        record.encode(&mut buf);
        write_bytes_at(&self.buffer, 0, &buf);
    }

    /// Assign the next LSN, serialize, and write `record` to the log
    /// tail, allocating further pages as needed when it straddles a page
    /// boundary. LSNs are strictly increasing.
    pub fn append(&self, mut record: LogRecord) -> RecoveryResult<Lsn> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        record.set_lsn(lsn);

        let mut buf = vec![];
        record.encode(&mut buf);
        if buf.len() > EFFECTIVE_PAGE_SIZE / 2 {
            return Err(RecoveryError::CorruptLogRecord {
                lsn,
                reason: format!("record of {} bytes exceeds the {}-byte ceiling", buf.len(), EFFECTIVE_PAGE_SIZE / 2),
            });
        }

        let offset = inner.write_offset;
        inner.index.insert(lsn, offset);
        inner.write_offset += buf.len() as u64;
        inner.next_lsn += 1;
        drop(inner);

        write_bytes_at(&self.buffer, offset, &buf);
        Ok(lsn)
    }

    pub fn flush_to_lsn(&self, lsn: Lsn) {
        let mut inner = self.inner.lock();
        if lsn > inner.durable_lsn {
            inner.durable_lsn = lsn;
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.inner.lock().durable_lsn
    }

    pub fn fetch(&self, lsn: Lsn) -> RecoveryResult<LogRecord> {
        let offset = if lsn == 0 {
            0
        } else {
            *self
                .inner
                .lock()
                .index
                .get(&lsn)
                .ok_or(RecoveryError::CorruptLogRecord { lsn, reason: "no such LSN".to_string() })?
        };
        let mut reader = LogByteReader { buffer: &self.buffer, pos: offset };
        LogRecord::decode(&mut reader)
            .map_err(|e| RecoveryError::CorruptLogRecord { lsn, reason: e.to_string() })
    }

    /// All records with LSN `>= lsn`, in LSN order. `0` includes the
    /// master record.
    pub fn scan_from(&self, lsn: Lsn) -> RecoveryResult<Vec<LogRecord>> {
        let lsns: Vec<Lsn> = {
            let inner = self.inner.lock();
            let mut v: Vec<Lsn> = inner.index.range(lsn..).map(|(l, _)| *l).collect();
            if lsn == 0 {
                v.insert(0, 0);
            }
            v
        };
        lsns.into_iter().map(|l| self.fetch(l)).collect()
    }

    /// In-place overwrite of LSN 0, followed by a flush (spec.md §4.6).
    pub fn rewrite_master(&self, last_checkpoint_begin_lsn: Lsn) {
        self.write_master_bytes(last_checkpoint_begin_lsn);
        self.flush_to_lsn(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsns_are_strictly_increasing_and_round_trip() {
        let log = LogManager::new(Arc::new(BufferManager::new()));
        let l1 = log
            .append(LogRecord::Commit { lsn: 0, transaction_num: 1, prev_lsn: 0 })
            .unwrap();
        let l2 = log
            .append(LogRecord::Abort { lsn: 0, transaction_num: 2, prev_lsn: 0 })
            .unwrap();
        assert!(l2 > l1);
        assert_eq!(log.fetch(l1).unwrap(), LogRecord::Commit { lsn: l1, transaction_num: 1, prev_lsn: 0 });
    }

    #[test]
    fn master_record_round_trips_through_rewrite() {
        let log = LogManager::new(Arc::new(BufferManager::new()));
        assert_eq!(log.fetch(0).unwrap(), LogRecord::Master { lsn: 0, last_checkpoint_begin_lsn: 0 });
        log.rewrite_master(42);
        assert_eq!(log.fetch(0).unwrap(), LogRecord::Master { lsn: 0, last_checkpoint_begin_lsn: 42 });
        assert_eq!(log.durable_lsn(), 0);
    }

    #[test]
    fn scan_from_returns_records_in_lsn_order() {
        let log = LogManager::new(Arc::new(BufferManager::new()));
        for i in 1..=5u64 {
            log.append(LogRecord::Commit { lsn: 0, transaction_num: i, prev_lsn: 0 }).unwrap();
        }
        let scanned = log.scan_from(3).unwrap();
        let nums: Vec<u64> = scanned
            .iter()
            .filter_map(|r| r.transaction_num())
            .collect();
        assert_eq!(nums, vec![3, 4, 5]);
    }

    #[test]
    fn a_record_spanning_a_page_boundary_still_round_trips() {
        let log = LogManager::new(Arc::new(BufferManager::new()));
        // burn bytes close to a page boundary so the next record straddles
        let filler_len = EFFECTIVE_PAGE_SIZE / 2 - 40;
        for _ in 0..20 {
            log.append(LogRecord::UpdatePage {
                lsn: 0,
                transaction_num: 1,
                prev_lsn: 0,
                page_num: 99,
                offset: 0,
                before: vec![0; filler_len / 20],
                after: vec![1; filler_len / 20],
            })
            .unwrap();
        }
        let straddler = log
            .append(LogRecord::UpdatePage {
                lsn: 0,
                transaction_num: 1,
                prev_lsn: 0,
                page_num: 100,
                offset: 0,
                before: vec![7; 100],
                after: vec![8; 100],
            })
            .unwrap();
        match log.fetch(straddler).unwrap() {
            LogRecord::UpdatePage { page_num, before, after, .. } => {
                assert_eq!(page_num, 100);
                assert_eq!(before, vec![7; 100]);
                assert_eq!(after, vec![8; 100]);
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
