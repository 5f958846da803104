//! `DiskSpaceManager` (spec.md §6, §4.10): tracks allocated pages and
//! partitions. No real I/O is performed — the `BufferManager`'s in-memory
//! page table stands in for the disk, which is sufficient to exercise WAL
//! ordering and redo/undo without a storage-engine implementation
//! (Non-goal: disk space manager internals).

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::recovery::record::{PageNum, PartNum};

/// Pages per partition, used to derive a page's owning partition the way
/// the teacher crate's `BTreePageID` derives a table id from a page
/// number: by fixed-width division rather than a stored mapping.
const PAGES_PER_PARTITION: u64 = 1 << 16;

/// Partition 0 is reserved for the log (spec.md §4.7, §6).
pub const LOG_PARTITION: PartNum = 0;

#[derive(Default)]
struct Inner {
    partitions: HashSet<PartNum>,
    pages: HashSet<PageNum>,
}

pub struct DiskSpaceManager {
    inner: Mutex<Inner>,
}

impl DiskSpaceManager {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }

    pub fn part_num(&self, page_num: PageNum) -> PartNum {
        page_num / PAGES_PER_PARTITION
    }

    pub fn page_num(part_num: PartNum, page_index: u64) -> PageNum {
        part_num * PAGES_PER_PARTITION + page_index
    }

    pub fn alloc_part(&self, part_num: PartNum) {
        self.inner.lock().partitions.insert(part_num);
    }

    pub fn free_part(&self, part_num: PartNum) {
        let mut inner = self.inner.lock();
        inner.partitions.remove(&part_num);
        inner.pages.retain(|p| *p / PAGES_PER_PARTITION != part_num);
    }

    pub fn alloc_page(&self, page_num: PageNum) {
        self.inner.lock().pages.insert(page_num);
    }

    pub fn free_page(&self, page_num: PageNum) {
        self.inner.lock().pages.remove(&page_num);
    }

    pub fn is_page_allocated(&self, page_num: PageNum) -> bool {
        self.inner.lock().pages.contains(&page_num)
    }
}

impl Default for DiskSpaceManager {
    fn default() -> Self {
        Self::new()
    }
}
