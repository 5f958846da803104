//! `RecoveryManager` (spec.md §4.7): forward processing, fuzzy
//! checkpointing, and the three-phase restart (analysis, redo, undo).

use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::buffer::{BufferManager, EFFECTIVE_PAGE_SIZE};
use crate::disk::{DiskSpaceManager, LOG_PARTITION};
use crate::error::{RecoveryError, RecoveryResult};
use crate::transaction::{Transaction, TransactionNum, TransactionStatus};

use super::log_manager::LogManager;
use super::record::{Lsn, LogRecord, PageNum, PartNum};

/// The end-checkpoint capacity oracle (spec.md §6's `fitsInOneRecord`).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointCapacity {
    pub max_dpt_entries_per_record: usize,
    pub max_txn_entries_per_record: usize,
}

impl CheckpointCapacity {
    pub fn fits_in_one_record(&self, dpt_entries: usize, txn_entries: usize) -> bool {
        dpt_entries <= self.max_dpt_entries_per_record && txn_entries <= self.max_txn_entries_per_record
    }
}

pub struct TransactionTableEntry {
    pub transaction: Arc<Transaction>,
    pub last_lsn: Lsn,
    pub savepoints: HashMap<String, Lsn>,
}

struct Inner {
    transaction_table: HashMap<TransactionNum, TransactionTableEntry>,
    dirty_page_table: BTreeMap<PageNum, Lsn>,
}

pub struct RecoveryManager {
    log_manager: Arc<LogManager>,
    buffer: Arc<BufferManager>,
    disk: Arc<DiskSpaceManager>,
    capacity: CheckpointCapacity,
    inner: Mutex<Inner>,
    /// Set once restart's redo phase has completed, so `disk_io_hook` only
    /// retires DPT entries for pages it knows have been brought current.
    redo_complete: AtomicBool,
}

impl RecoveryManager {
    pub fn new(
        log_manager: Arc<LogManager>,
        buffer: Arc<BufferManager>,
        disk: Arc<DiskSpaceManager>,
        capacity: CheckpointCapacity,
    ) -> Self {
        Self {
            log_manager,
            buffer,
            disk,
            capacity,
            inner: Mutex::new(Inner {
                transaction_table: HashMap::new(),
                dirty_page_table: BTreeMap::new(),
            }),
            redo_complete: AtomicBool::new(false),
        }
    }

    fn last_lsn(&self, tx_num: TransactionNum) -> Lsn {
        self.inner.lock().transaction_table.get(&tx_num).map(|e| e.last_lsn).unwrap_or(0)
    }

    fn set_last_lsn(&self, tx_num: TransactionNum, lsn: Lsn) {
        self.inner
            .lock()
            .transaction_table
            .get_mut(&tx_num)
            .expect("transaction must be started before its lastLSN is updated")
            .last_lsn = lsn;
    }

    fn ensure_transaction(&self, tx_num: TransactionNum) {
        let mut inner = self.inner.lock();
        inner.transaction_table.entry(tx_num).or_insert_with(|| TransactionTableEntry {
            transaction: Arc::new(Transaction::with_num(tx_num)),
            last_lsn: 0,
            savepoints: HashMap::new(),
        });
    }

    fn transaction_by_num(&self, tx_num: TransactionNum) -> Arc<Transaction> {
        self.inner
            .lock()
            .transaction_table
            .get(&tx_num)
            .expect("transaction must be materialized before being looked up")
            .transaction
            .clone()
    }

    fn cleanup_transaction(&self, tx_num: TransactionNum) {
        if let Some(entry) = self.inner.lock().transaction_table.remove(&tx_num) {
            entry.transaction.cleanup();
        }
    }

    // ---- forward processing (spec.md §4.7) ----

    pub fn start(&self, tx: &Arc<Transaction>) {
        self.inner.lock().transaction_table.insert(
            tx.get_transaction_num(),
            TransactionTableEntry { transaction: tx.clone(), last_lsn: 0, savepoints: HashMap::new() },
        );
    }

    pub fn log_page_write(
        &self,
        tx: &Arc<Transaction>,
        page_num: PageNum,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> RecoveryResult<Lsn> {
        if before.len() != after.len() || before.len() > EFFECTIVE_PAGE_SIZE / 2 {
            return Err(RecoveryError::CorruptLogRecord {
                lsn: 0,
                reason: format!(
                    "update to page {} has mismatched or oversized before/after images ({} bytes, ceiling {})",
                    page_num,
                    before.len(),
                    EFFECTIVE_PAGE_SIZE / 2
                ),
            });
        }
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self
            .log_manager
            .append(LogRecord::UpdatePage { lsn: 0, transaction_num: tx_num, prev_lsn, page_num, offset, before, after })?;
        self.set_last_lsn(tx_num, lsn);
        self.inner.lock().dirty_page_table.entry(page_num).or_insert(lsn);
        Ok(lsn)
    }

    /// `None` when `page_num` falls in the log partition: those
    /// operations are silently skipped (spec.md §4.7).
    pub fn log_alloc_page(&self, tx: &Arc<Transaction>, page_num: PageNum) -> RecoveryResult<Option<Lsn>> {
        if self.disk.part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::AllocPage { lsn: 0, transaction_num: tx_num, prev_lsn, page_num })?;
        self.set_last_lsn(tx_num, lsn);
        self.disk.alloc_page(page_num);
        self.log_manager.flush_to_lsn(lsn);
        Ok(Some(lsn))
    }

    pub fn log_free_page(&self, tx: &Arc<Transaction>, page_num: PageNum) -> RecoveryResult<Option<Lsn>> {
        if self.disk.part_num(page_num) == LOG_PARTITION {
            return Ok(None);
        }
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::FreePage { lsn: 0, transaction_num: tx_num, prev_lsn, page_num })?;
        self.set_last_lsn(tx_num, lsn);
        self.disk.free_page(page_num);
        self.log_manager.flush_to_lsn(lsn);
        self.inner.lock().dirty_page_table.remove(&page_num);
        Ok(Some(lsn))
    }

    pub fn log_alloc_part(&self, tx: &Arc<Transaction>, part_num: PartNum) -> RecoveryResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::AllocPart { lsn: 0, transaction_num: tx_num, prev_lsn, part_num })?;
        self.set_last_lsn(tx_num, lsn);
        self.disk.alloc_part(part_num);
        self.log_manager.flush_to_lsn(lsn);
        Ok(Some(lsn))
    }

    pub fn log_free_part(&self, tx: &Arc<Transaction>, part_num: PartNum) -> RecoveryResult<Option<Lsn>> {
        if part_num == LOG_PARTITION {
            return Ok(None);
        }
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::FreePart { lsn: 0, transaction_num: tx_num, prev_lsn, part_num })?;
        self.set_last_lsn(tx_num, lsn);
        self.disk.free_part(part_num);
        self.log_manager.flush_to_lsn(lsn);
        Ok(Some(lsn))
    }

    pub fn dirty_page(&self, page_num: PageNum, lsn: Lsn) {
        let mut inner = self.inner.lock();
        let entry = inner.dirty_page_table.entry(page_num).or_insert(lsn);
        if lsn < *entry {
            *entry = lsn;
        }
    }

    pub fn commit(&self, tx: &Arc<Transaction>) -> RecoveryResult<Lsn> {
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::Commit { lsn: 0, transaction_num: tx_num, prev_lsn })?;
        self.set_last_lsn(tx_num, lsn);
        self.log_manager.flush_to_lsn(lsn);
        tx.set_status(TransactionStatus::Committing);
        Ok(lsn)
    }

    pub fn abort(&self, tx: &Arc<Transaction>) -> RecoveryResult<Lsn> {
        let tx_num = tx.get_transaction_num();
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::Abort { lsn: 0, transaction_num: tx_num, prev_lsn })?;
        self.set_last_lsn(tx_num, lsn);
        tx.set_status(TransactionStatus::Aborting);
        Ok(lsn)
    }

    pub fn end(&self, tx: &Arc<Transaction>) -> RecoveryResult<Lsn> {
        let tx_num = tx.get_transaction_num();
        if tx.get_status() == TransactionStatus::Aborting {
            self.rollback_to_lsn(tx, 0)?;
        }
        let prev_lsn = self.last_lsn(tx_num);
        let lsn = self.log_manager.append(LogRecord::End { lsn: 0, transaction_num: tx_num, prev_lsn })?;
        self.cleanup_transaction(tx_num);
        tx.set_status(TransactionStatus::Complete);
        Ok(lsn)
    }

    pub fn savepoint(&self, tx: &Arc<Transaction>, name: impl Into<String>) {
        let tx_num = tx.get_transaction_num();
        let last_lsn = self.last_lsn(tx_num);
        self.inner
            .lock()
            .transaction_table
            .get_mut(&tx_num)
            .expect("transaction must be started before it can take a savepoint")
            .savepoints
            .insert(name.into(), last_lsn);
    }

    pub fn rollback_to_savepoint(&self, tx: &Arc<Transaction>, name: &str) -> RecoveryResult<()> {
        let tx_num = tx.get_transaction_num();
        let target = *self
            .inner
            .lock()
            .transaction_table
            .get(&tx_num)
            .and_then(|e| e.savepoints.get(name))
            .ok_or(RecoveryError::UnknownTransaction(tx_num))?;
        self.rollback_to_lsn(tx, target)
    }

    /// Write-ahead hook: call before evicting a dirty page, with that
    /// page's current `pageLSN`.
    pub fn page_flush_hook(&self, page_lsn: Lsn) {
        self.log_manager.flush_to_lsn(page_lsn);
    }

    pub fn disk_io_hook(&self, page_num: PageNum) {
        if self.redo_complete.load(Ordering::SeqCst) {
            self.inner.lock().dirty_page_table.remove(&page_num);
        }
    }

    /// Undo `tx`'s updates back to (but not including) `target_lsn`,
    /// emitting one CLR per undone record (spec.md §4.7).
    fn rollback_to_lsn(&self, tx: &Arc<Transaction>, target_lsn: Lsn) -> RecoveryResult<()> {
        let tx_num = tx.get_transaction_num();
        let last_lsn = self.last_lsn(tx_num);
        if last_lsn == 0 {
            return Ok(());
        }
        let last_record = self.log_manager.fetch(last_lsn)?;
        let mut current = last_record.undo_next_lsn().unwrap_or(last_lsn);

        while current > target_lsn {
            let record = self.log_manager.fetch(current)?;
            if record.is_undoable() {
                let prev_lsn = self.last_lsn(tx_num);
                let clr = record.to_clr(prev_lsn).expect("undoable records always produce a CLR");
                let clr_lsn = self.log_manager.append(clr.clone())?;
                self.set_last_lsn(tx_num, clr_lsn);
                clr.redo(&self.buffer, &self.disk);
            }
            current = record.undo_next_lsn().or_else(|| record.prev_lsn()).unwrap_or(0);
        }
        Ok(())
    }

    // ---- checkpointing (spec.md §4.7) ----

    fn pack_checkpoint_records(
        &self,
        dpt_entries: Vec<(PageNum, Lsn)>,
        txn_entries: Vec<(TransactionNum, TransactionStatus, Lsn)>,
    ) -> Vec<LogRecord> {
        let mut records = vec![];

        let mut chunk = vec![];
        for entry in dpt_entries {
            if !self.capacity.fits_in_one_record(chunk.len() + 1, 0) {
                records.push(LogRecord::EndCheckpoint { lsn: 0, dirty_page_table: std::mem::take(&mut chunk), transaction_table: vec![] });
            }
            chunk.push(entry);
        }
        if !chunk.is_empty() {
            records.push(LogRecord::EndCheckpoint { lsn: 0, dirty_page_table: chunk, transaction_table: vec![] });
        }

        let mut chunk = vec![];
        for entry in txn_entries {
            if !self.capacity.fits_in_one_record(0, chunk.len() + 1) {
                records.push(LogRecord::EndCheckpoint { lsn: 0, dirty_page_table: vec![], transaction_table: std::mem::take(&mut chunk) });
            }
            chunk.push(entry);
        }
        if !chunk.is_empty() {
            records.push(LogRecord::EndCheckpoint { lsn: 0, dirty_page_table: vec![], transaction_table: chunk });
        }

        if records.is_empty() {
            records.push(LogRecord::EndCheckpoint { lsn: 0, dirty_page_table: vec![], transaction_table: vec![] });
        }
        records
    }

    pub fn checkpoint(&self) -> RecoveryResult<()> {
        let begin_lsn = self.log_manager.append(LogRecord::BeginCheckpoint { lsn: 0 })?;

        let (dpt_entries, txn_entries) = {
            let inner = self.inner.lock();
            (
                inner.dirty_page_table.iter().map(|(p, l)| (*p, *l)).collect::<Vec<_>>(),
                inner
                    .transaction_table
                    .iter()
                    .map(|(num, e)| (*num, e.transaction.get_status(), e.last_lsn))
                    .collect::<Vec<_>>(),
            )
        };

        let mut last_end_lsn = begin_lsn;
        for record in self.pack_checkpoint_records(dpt_entries, txn_entries) {
            last_end_lsn = self.log_manager.append(record)?;
        }

        self.log_manager.flush_to_lsn(last_end_lsn);
        self.log_manager.rewrite_master(begin_lsn);
        Ok(())
    }

    // ---- restart (spec.md §4.7) ----

    pub fn restart(&self) -> RecoveryResult<()> {
        self.redo_complete.store(false, Ordering::SeqCst);
        let begin_lsn = match self.log_manager.fetch(0)? {
            LogRecord::Master { last_checkpoint_begin_lsn, .. } => last_checkpoint_begin_lsn,
            _ => return Err(RecoveryError::MissingMasterRecord),
        };

        self.analysis(begin_lsn)?;
        self.redo()?;
        self.redo_complete.store(true, Ordering::SeqCst);
        self.clean_dirty_page_table();
        self.undo()?;
        self.checkpoint()?;
        Ok(())
    }

    fn analysis(&self, begin_lsn: Lsn) -> RecoveryResult<()> {
        let mut ended: HashSet<TransactionNum> = HashSet::new();

        for record in self.log_manager.scan_from(begin_lsn)? {
            if let Some(tx_num) = record.transaction_num() {
                self.ensure_transaction(tx_num);
                self.set_last_lsn(tx_num, record.lsn());
            }

            if let Some(page_num) = record.page_num() {
                match &record {
                    LogRecord::UpdatePage { .. } | LogRecord::UndoUpdatePage { .. } => {
                        self.inner.lock().dirty_page_table.entry(page_num).or_insert(record.lsn());
                    }
                    LogRecord::FreePage { .. } | LogRecord::UndoAllocPage { .. } => {
                        self.log_manager.flush_to_lsn(record.lsn());
                        self.inner.lock().dirty_page_table.remove(&page_num);
                    }
                    _ => {}
                }
            }

            match &record {
                LogRecord::Commit { transaction_num, .. } => {
                    self.transaction_by_num(*transaction_num).set_status(TransactionStatus::Committing);
                }
                LogRecord::Abort { transaction_num, .. } => {
                    self.transaction_by_num(*transaction_num).set_status(TransactionStatus::RecoveryAborting);
                }
                LogRecord::End { transaction_num, .. } => {
                    self.cleanup_transaction(*transaction_num);
                    ended.insert(*transaction_num);
                }
                LogRecord::EndCheckpoint { dirty_page_table, transaction_table, .. } => {
                    {
                        let mut inner = self.inner.lock();
                        for (page, lsn) in dirty_page_table {
                            inner.dirty_page_table.insert(*page, *lsn);
                        }
                    }
                    for (tx_num, status, checkpoint_last_lsn) in transaction_table {
                        if ended.contains(tx_num) {
                            continue;
                        }
                        self.ensure_transaction(*tx_num);
                        {
                            let mut inner = self.inner.lock();
                            let entry = inner.transaction_table.get_mut(tx_num).unwrap();
                            entry.last_lsn = entry.last_lsn.max(*checkpoint_last_lsn);
                        }
                        let tx = self.transaction_by_num(*tx_num);
                        let upgraded = match (tx.get_status(), status) {
                            (TransactionStatus::Running, TransactionStatus::Committing) => Some(TransactionStatus::Committing),
                            (TransactionStatus::Running, TransactionStatus::Aborting)
                            | (TransactionStatus::Running, TransactionStatus::RecoveryAborting) => Some(TransactionStatus::RecoveryAborting),
                            (current, TransactionStatus::Complete) if current != TransactionStatus::Complete => Some(TransactionStatus::Complete),
                            _ => None,
                        };
                        if let Some(next_status) = upgraded {
                            tx.set_status(next_status);
                        }
                    }
                }
                _ => {}
            }
        }

        let remaining: Vec<TransactionNum> = self.inner.lock().transaction_table.keys().copied().collect();
        for tx_num in remaining {
            let tx = self.transaction_by_num(tx_num);
            match tx.get_status() {
                TransactionStatus::Committing => {
                    let prev_lsn = self.last_lsn(tx_num);
                    let lsn = self.log_manager.append(LogRecord::End { lsn: 0, transaction_num: tx_num, prev_lsn })?;
                    self.set_last_lsn(tx_num, lsn);
                    self.cleanup_transaction(tx_num);
                }
                TransactionStatus::Running => {
                    tx.set_status(TransactionStatus::RecoveryAborting);
                    let prev_lsn = self.last_lsn(tx_num);
                    let lsn = self.log_manager.append(LogRecord::Abort { lsn: 0, transaction_num: tx_num, prev_lsn })?;
                    self.set_last_lsn(tx_num, lsn);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn redo(&self) -> RecoveryResult<()> {
        let start = self.inner.lock().dirty_page_table.values().copied().min();
        let start = match start {
            Some(lsn) => lsn,
            None => return Ok(()),
        };

        for record in self.log_manager.scan_from(start)? {
            if !record.is_redoable() {
                continue;
            }
            let should_redo = match &record {
                LogRecord::AllocPage { .. }
                | LogRecord::UndoFreePage { .. }
                | LogRecord::AllocPart { .. }
                | LogRecord::FreePart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::UndoFreePart { .. } => true,
                LogRecord::UpdatePage { page_num, .. }
                | LogRecord::UndoUpdatePage { page_num, .. }
                | LogRecord::FreePage { page_num, .. }
                | LogRecord::UndoAllocPage { page_num, .. } => {
                    let dpt_lsn = self.inner.lock().dirty_page_table.get(page_num).copied();
                    match dpt_lsn {
                        Some(rec_lsn) if record.lsn() >= rec_lsn => record.lsn() > self.buffer.fetch_page(*page_num).page_lsn(),
                        _ => false,
                    }
                }
                _ => false,
            };
            if should_redo {
                record.redo(&self.buffer, &self.disk);
            }
        }
        Ok(())
    }

    fn clean_dirty_page_table(&self) {
        let mut dirty_pages = HashSet::new();
        self.buffer.iter_page_nums(|num, is_dirty| {
            if is_dirty {
                dirty_pages.insert(num);
            }
        });
        self.inner.lock().dirty_page_table.retain(|p, _| dirty_pages.contains(p));
    }

    fn undo(&self) -> RecoveryResult<()> {
        let mut heap: BinaryHeap<(Lsn, TransactionNum)> = BinaryHeap::new();
        {
            let inner = self.inner.lock();
            for (tx_num, entry) in inner.transaction_table.iter() {
                if entry.transaction.get_status() == TransactionStatus::RecoveryAborting {
                    heap.push((entry.last_lsn, *tx_num));
                }
            }
        }

        while let Some((lsn, tx_num)) = heap.pop() {
            let record = self.log_manager.fetch(lsn)?;
            let next = if record.is_undoable() {
                let prev_lsn = self.last_lsn(tx_num);
                let clr = record.to_clr(prev_lsn).expect("undoable records always produce a CLR");
                let clr_lsn = self.log_manager.append(clr.clone())?;
                self.set_last_lsn(tx_num, clr_lsn);
                clr.redo(&self.buffer, &self.disk);
                record.prev_lsn().unwrap_or(0)
            } else {
                record.undo_next_lsn().or_else(|| record.prev_lsn()).unwrap_or(0)
            };

            if next == 0 {
                let tx = self.transaction_by_num(tx_num);
                let prev_lsn = self.last_lsn(tx_num);
                let end_lsn = self.log_manager.append(LogRecord::End { lsn: 0, transaction_num: tx_num, prev_lsn })?;
                self.set_last_lsn(tx_num, end_lsn);
                tx.set_status(TransactionStatus::Complete);
                self.cleanup_transaction(tx_num);
            } else {
                heap.push((next, tx_num));
            }
        }
        Ok(())
    }
}
