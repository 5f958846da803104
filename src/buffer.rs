//! `BufferManager` (spec.md §6, §4.9): an in-memory page table. No
//! eviction policy is implemented (Non-goal: buffer-manager internals) —
//! pages live for the lifetime of the `Database` and exist purely to let
//! the recovery manager exercise WAL ordering and redo/undo against real
//! page bytes and `pageLSN`s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::recovery::record::{Lsn, PageNum};

/// Mirrors the teacher crate's `PAGE_SIZE` constant.
pub const EFFECTIVE_PAGE_SIZE: usize = 4096;

pub struct Page {
    bytes: Mutex<Vec<u8>>,
    page_lsn: AtomicU64,
    dirty: AtomicBool,
    pin_count: AtomicUsize,
}

impl Page {
    fn new() -> Self {
        Self {
            bytes: Mutex::new(vec![0u8; EFFECTIVE_PAGE_SIZE]),
            page_lsn: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            pin_count: AtomicUsize::new(0),
        }
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        if bytes.len() < offset + data.len() {
            bytes.resize(offset + data.len(), 0);
        }
        bytes[offset..offset + data.len()].copy_from_slice(data);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let mut out = vec![0u8; len];
        let available = bytes.len().saturating_sub(offset).min(len);
        out[..available].copy_from_slice(&bytes[offset..offset + available]);
        out
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn.load(Ordering::SeqCst)
    }

    pub fn set_page_lsn(&self, lsn: Lsn) {
        self.page_lsn.store(lsn, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn mark_clean(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }

    pub fn unpin(&self) {
        self.pin_count.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct BufferManager {
    pages: Mutex<HashMap<PageNum, Arc<Page>>>,
}

impl BufferManager {
    pub fn new() -> Self {
        Self { pages: Mutex::new(HashMap::new()) }
    }

    /// Fetch (creating if absent) and pin the page.
    pub fn fetch_page(&self, page_num: PageNum) -> Arc<Page> {
        let mut pages = self.pages.lock();
        let page = pages.entry(page_num).or_insert_with(|| Arc::new(Page::new())).clone();
        page.pin_count.fetch_add(1, Ordering::SeqCst);
        page
    }

    pub fn remove_page(&self, page_num: PageNum) {
        self.pages.lock().remove(&page_num);
    }

    pub fn iter_page_nums(&self, mut f: impl FnMut(PageNum, bool)) {
        for (num, page) in self.pages.lock().iter() {
            f(*num, page.is_dirty());
        }
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}
