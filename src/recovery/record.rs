//! The log record sum type (spec.md §4.5): every record knows how to
//! serialize, redo (apply its physical effect), and, for the five
//! undoable variants, produce the compensation record that undoes it.

use crate::buffer::BufferManager;
use crate::codec::{Decode, Encode};
use crate::disk::DiskSpaceManager;
use crate::transaction::{TransactionNum, TransactionStatus};

pub type Lsn = u64;
pub type PageNum = u64;
pub type PartNum = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Master {
        lsn: Lsn,
        last_checkpoint_begin_lsn: Lsn,
    },
    BeginCheckpoint {
        lsn: Lsn,
    },
    EndCheckpoint {
        lsn: Lsn,
        dirty_page_table: Vec<(PageNum, Lsn)>,
        transaction_table: Vec<(TransactionNum, TransactionStatus, Lsn)>,
    },
    UpdatePage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        page_num: PageNum,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    UndoUpdatePage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_num: PageNum,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    AllocPage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoAllocPage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_num: PageNum,
    },
    FreePage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        page_num: PageNum,
    },
    UndoFreePage {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        page_num: PageNum,
    },
    AllocPart {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    FreePart {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        part_num: PartNum,
    },
    UndoAllocPart {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        part_num: PartNum,
    },
    UndoFreePart {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
        undo_next_lsn: Lsn,
        part_num: PartNum,
    },
    Commit {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
    },
    Abort {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
    },
    End {
        lsn: Lsn,
        transaction_num: TransactionNum,
        prev_lsn: Lsn,
    },
}

/// Tag byte for the wire format. Order is arbitrary but fixed once chosen.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Master = 0,
    BeginCheckpoint = 1,
    EndCheckpoint = 2,
    UpdatePage = 3,
    UndoUpdatePage = 4,
    AllocPage = 5,
    UndoAllocPage = 6,
    FreePage = 7,
    UndoFreePage = 8,
    AllocPart = 9,
    FreePart = 10,
    UndoAllocPart = 11,
    UndoFreePart = 12,
    Commit = 13,
    Abort = 14,
    End = 15,
}

impl Tag {
    fn from_u8(v: u8) -> crate::codec::DecodeResult<Self> {
        Ok(match v {
            0 => Tag::Master,
            1 => Tag::BeginCheckpoint,
            2 => Tag::EndCheckpoint,
            3 => Tag::UpdatePage,
            4 => Tag::UndoUpdatePage,
            5 => Tag::AllocPage,
            6 => Tag::UndoAllocPage,
            7 => Tag::FreePage,
            8 => Tag::UndoFreePage,
            9 => Tag::AllocPart,
            10 => Tag::FreePart,
            11 => Tag::UndoAllocPart,
            12 => Tag::UndoFreePart,
            13 => Tag::Commit,
            14 => Tag::Abort,
            15 => Tag::End,
            other => return Err(crate::codec::DecodeError::InvalidTag(other)),
        })
    }
}

impl LogRecord {
    pub fn lsn(&self) -> Lsn {
        use LogRecord::*;
        match self {
            Master { lsn, .. }
            | BeginCheckpoint { lsn, .. }
            | EndCheckpoint { lsn, .. }
            | UpdatePage { lsn, .. }
            | UndoUpdatePage { lsn, .. }
            | AllocPage { lsn, .. }
            | UndoAllocPage { lsn, .. }
            | FreePage { lsn, .. }
            | UndoFreePage { lsn, .. }
            | AllocPart { lsn, .. }
            | FreePart { lsn, .. }
            | UndoAllocPart { lsn, .. }
            | UndoFreePart { lsn, .. }
            | Commit { lsn, .. }
            | Abort { lsn, .. }
            | End { lsn, .. } => *lsn,
        }
    }

    pub fn set_lsn(&mut self, new_lsn: Lsn) {
        use LogRecord::*;
        match self {
            Master { lsn, .. }
            | BeginCheckpoint { lsn, .. }
            | EndCheckpoint { lsn, .. }
            | UpdatePage { lsn, .. }
            | UndoUpdatePage { lsn, .. }
            | AllocPage { lsn, .. }
            | UndoAllocPage { lsn, .. }
            | FreePage { lsn, .. }
            | UndoFreePage { lsn, .. }
            | AllocPart { lsn, .. }
            | FreePart { lsn, .. }
            | UndoAllocPart { lsn, .. }
            | UndoFreePart { lsn, .. }
            | Commit { lsn, .. }
            | Abort { lsn, .. }
            | End { lsn, .. } => *lsn = new_lsn,
        }
    }

    pub fn transaction_num(&self) -> Option<TransactionNum> {
        use LogRecord::*;
        match self {
            UpdatePage { transaction_num, .. }
            | UndoUpdatePage { transaction_num, .. }
            | AllocPage { transaction_num, .. }
            | UndoAllocPage { transaction_num, .. }
            | FreePage { transaction_num, .. }
            | UndoFreePage { transaction_num, .. }
            | AllocPart { transaction_num, .. }
            | FreePart { transaction_num, .. }
            | UndoAllocPart { transaction_num, .. }
            | UndoFreePart { transaction_num, .. }
            | Commit { transaction_num, .. }
            | Abort { transaction_num, .. }
            | End { transaction_num, .. } => Some(*transaction_num),
            Master { .. } | BeginCheckpoint { .. } | EndCheckpoint { .. } => None,
        }
    }

    pub fn prev_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UpdatePage { prev_lsn, .. }
            | UndoUpdatePage { prev_lsn, .. }
            | AllocPage { prev_lsn, .. }
            | UndoAllocPage { prev_lsn, .. }
            | FreePage { prev_lsn, .. }
            | UndoFreePage { prev_lsn, .. }
            | AllocPart { prev_lsn, .. }
            | FreePart { prev_lsn, .. }
            | UndoAllocPart { prev_lsn, .. }
            | UndoFreePart { prev_lsn, .. }
            | Commit { prev_lsn, .. }
            | Abort { prev_lsn, .. }
            | End { prev_lsn, .. } => Some(*prev_lsn),
            Master { .. } | BeginCheckpoint { .. } | EndCheckpoint { .. } => None,
        }
    }

    pub fn undo_next_lsn(&self) -> Option<Lsn> {
        use LogRecord::*;
        match self {
            UndoUpdatePage { undo_next_lsn, .. }
            | UndoAllocPage { undo_next_lsn, .. }
            | UndoFreePage { undo_next_lsn, .. }
            | UndoAllocPart { undo_next_lsn, .. }
            | UndoFreePart { undo_next_lsn, .. } => Some(*undo_next_lsn),
            _ => None,
        }
    }

    pub fn page_num(&self) -> Option<PageNum> {
        use LogRecord::*;
        match self {
            UpdatePage { page_num, .. }
            | UndoUpdatePage { page_num, .. }
            | AllocPage { page_num, .. }
            | UndoAllocPage { page_num, .. }
            | FreePage { page_num, .. }
            | UndoFreePage { page_num, .. } => Some(*page_num),
            _ => None,
        }
    }

    /// Constants per variant (spec.md §4.5, §3 R2): only the five base
    /// mutating records are undoable. Their `Undo*` compensation
    /// counterparts, once logged, are never undone again.
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

    /// The ten page/partition-effecting variants are redoable; master,
    /// checkpoint, and status-change records are not (spec.md §3 R2).
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
                | LogRecord::FreePart { .. }
                | LogRecord::UndoAllocPart { .. }
                | LogRecord::UndoFreePart { .. }
        )
    }

    /// Apply this record's physical effect. Only meaningful when
    /// [`is_redoable`] is true; a no-op otherwise.
    pub fn redo(&self, buffer: &BufferManager, disk: &DiskSpaceManager) {
        use LogRecord::*;
        match self {
            UpdatePage { lsn, page_num, offset, after, .. } | UndoUpdatePage { lsn, page_num, offset, after, .. } => {
                let page = buffer.fetch_page(*page_num);
                page.write(*offset as usize, after);
                page.set_page_lsn(*lsn);
            }
            AllocPage { lsn, page_num, .. } | UndoFreePage { lsn, page_num, .. } => {
                disk.alloc_page(*page_num);
                buffer.fetch_page(*page_num).set_page_lsn(*lsn);
            }
            FreePage { page_num, .. } | UndoAllocPage { page_num, .. } => {
                disk.free_page(*page_num);
                buffer.remove_page(*page_num);
            }
            AllocPart { part_num, .. } | UndoFreePart { part_num, .. } => {
                disk.alloc_part(*part_num);
            }
            FreePart { part_num, .. } | UndoAllocPart { part_num, .. } => {
                disk.free_part(*part_num);
            }
            Master { .. } | BeginCheckpoint { .. } | EndCheckpoint { .. } | Commit { .. } | Abort { .. } | End { .. } => {}
        }
    }

    /// Build the compensation record that undoes this one, threading
    /// `prev_lsn` as the new record's place in the transaction's chain
    /// (the transaction's true last LSN at the moment of undo, which may
    /// already include earlier CLRs) and pointing `undo_next_lsn` at
    /// this record's own `prev_lsn` so restart skips straight past it.
    /// `None` unless [`is_undoable`] is true.
    pub fn to_clr(&self, prev_lsn: Lsn) -> Option<LogRecord> {
        use LogRecord::*;
        match self {
            UpdatePage {
                transaction_num,
                prev_lsn: original_prev,
                page_num,
                offset,
                before,
                after,
                ..
            } => Some(UndoUpdatePage {
                lsn: 0,
                transaction_num: *transaction_num,
                prev_lsn,
                undo_next_lsn: *original_prev,
                page_num: *page_num,
                offset: *offset,
                before: after.clone(),
                after: before.clone(),
            }),
            AllocPage {
                transaction_num,
                prev_lsn: original_prev,
                page_num,
                ..
            } => Some(UndoAllocPage {
                lsn: 0,
                transaction_num: *transaction_num,
                prev_lsn,
                undo_next_lsn: *original_prev,
                page_num: *page_num,
            }),
            FreePage {
                transaction_num,
                prev_lsn: original_prev,
                page_num,
                ..
            } => Some(UndoFreePage {
                lsn: 0,
                transaction_num: *transaction_num,
                prev_lsn,
                undo_next_lsn: *original_prev,
                page_num: *page_num,
            }),
            AllocPart {
                transaction_num,
                prev_lsn: original_prev,
                part_num,
                ..
            } => Some(UndoAllocPart {
                lsn: 0,
                transaction_num: *transaction_num,
                prev_lsn,
                undo_next_lsn: *original_prev,
                part_num: *part_num,
            }),
            FreePart {
                transaction_num,
                prev_lsn: original_prev,
                part_num,
                ..
            } => Some(UndoFreePart {
                lsn: 0,
                transaction_num: *transaction_num,
                prev_lsn,
                undo_next_lsn: *original_prev,
                part_num: *part_num,
            }),
            _ => None,
        }
    }
}

impl Encode for LogRecord {
    fn encode(&self, buf: &mut Vec<u8>) {
        use LogRecord::*;
        match self {
            Master { lsn, last_checkpoint_begin_lsn } => {
                (Tag::Master as u8).encode(buf);
                lsn.encode(buf);
                last_checkpoint_begin_lsn.encode(buf);
            }
            BeginCheckpoint { lsn } => {
                (Tag::BeginCheckpoint as u8).encode(buf);
                lsn.encode(buf);
            }
            EndCheckpoint { lsn, dirty_page_table, transaction_table } => {
                (Tag::EndCheckpoint as u8).encode(buf);
                lsn.encode(buf);
                (dirty_page_table.len() as u32).encode(buf);
                for (page, rec_lsn) in dirty_page_table {
                    page.encode(buf);
                    rec_lsn.encode(buf);
                }
                (transaction_table.len() as u32).encode(buf);
                for (tx, status, last_lsn) in transaction_table {
                    tx.encode(buf);
                    status.encode(buf);
                    last_lsn.encode(buf);
                }
            }
            UpdatePage { lsn, transaction_num, prev_lsn, page_num, offset, before, after } => {
                (Tag::UpdatePage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                page_num.encode(buf);
                offset.encode(buf);
                before.encode(buf);
                after.encode(buf);
            }
            UndoUpdatePage { lsn, transaction_num, prev_lsn, undo_next_lsn, page_num, offset, before, after } => {
                (Tag::UndoUpdatePage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                undo_next_lsn.encode(buf);
                page_num.encode(buf);
                offset.encode(buf);
                before.encode(buf);
                after.encode(buf);
            }
            AllocPage { lsn, transaction_num, prev_lsn, page_num } => {
                (Tag::AllocPage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                page_num.encode(buf);
            }
            UndoAllocPage { lsn, transaction_num, prev_lsn, undo_next_lsn, page_num } => {
                (Tag::UndoAllocPage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                undo_next_lsn.encode(buf);
                page_num.encode(buf);
            }
            FreePage { lsn, transaction_num, prev_lsn, page_num } => {
                (Tag::FreePage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                page_num.encode(buf);
            }
            UndoFreePage { lsn, transaction_num, prev_lsn, undo_next_lsn, page_num } => {
                (Tag::UndoFreePage as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                undo_next_lsn.encode(buf);
                page_num.encode(buf);
            }
            AllocPart { lsn, transaction_num, prev_lsn, part_num } => {
                (Tag::AllocPart as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                part_num.encode(buf);
            }
            FreePart { lsn, transaction_num, prev_lsn, part_num } => {
                (Tag::FreePart as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                part_num.encode(buf);
            }
            UndoAllocPart { lsn, transaction_num, prev_lsn, undo_next_lsn, part_num } => {
                (Tag::UndoAllocPart as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                undo_next_lsn.encode(buf);
                part_num.encode(buf);
            }
            UndoFreePart { lsn, transaction_num, prev_lsn, undo_next_lsn, part_num } => {
                (Tag::UndoFreePart as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
                undo_next_lsn.encode(buf);
                part_num.encode(buf);
            }
            Commit { lsn, transaction_num, prev_lsn } => {
                (Tag::Commit as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
            }
            Abort { lsn, transaction_num, prev_lsn } => {
                (Tag::Abort as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
            }
            End { lsn, transaction_num, prev_lsn } => {
                (Tag::End as u8).encode(buf);
                lsn.encode(buf);
                transaction_num.encode(buf);
                prev_lsn.encode(buf);
            }
        }
    }
}

impl Decode for LogRecord {
    fn decode(reader: &mut impl std::io::Read) -> crate::codec::DecodeResult<Self> {
        let tag = Tag::from_u8(u8::decode(reader)?)?;
        Ok(match tag {
            Tag::Master => LogRecord::Master {
                lsn: Lsn::decode(reader)?,
                last_checkpoint_begin_lsn: Lsn::decode(reader)?,
            },
            Tag::BeginCheckpoint => LogRecord::BeginCheckpoint { lsn: Lsn::decode(reader)? },
            Tag::EndCheckpoint => {
                let lsn = Lsn::decode(reader)?;
                let dpt_count = u32::decode(reader)? as usize;
                let mut dirty_page_table = Vec::with_capacity(dpt_count);
                for _ in 0..dpt_count {
                    dirty_page_table.push((PageNum::decode(reader)?, Lsn::decode(reader)?));
                }
                let txn_count = u32::decode(reader)? as usize;
                let mut transaction_table = Vec::with_capacity(txn_count);
                for _ in 0..txn_count {
                    transaction_table.push((
                        TransactionNum::decode(reader)?,
                        TransactionStatus::decode(reader)?,
                        Lsn::decode(reader)?,
                    ));
                }
                LogRecord::EndCheckpoint { lsn, dirty_page_table, transaction_table }
            }
            Tag::UpdatePage => LogRecord::UpdatePage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
                offset: u16::decode(reader)?,
                before: Vec::<u8>::decode(reader)?,
                after: Vec::<u8>::decode(reader)?,
            },
            Tag::UndoUpdatePage => LogRecord::UndoUpdatePage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                undo_next_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
                offset: u16::decode(reader)?,
                before: Vec::<u8>::decode(reader)?,
                after: Vec::<u8>::decode(reader)?,
            },
            Tag::AllocPage => LogRecord::AllocPage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
            },
            Tag::UndoAllocPage => LogRecord::UndoAllocPage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                undo_next_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
            },
            Tag::FreePage => LogRecord::FreePage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
            },
            Tag::UndoFreePage => LogRecord::UndoFreePage {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                undo_next_lsn: Lsn::decode(reader)?,
                page_num: PageNum::decode(reader)?,
            },
            Tag::AllocPart => LogRecord::AllocPart {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                part_num: PartNum::decode(reader)?,
            },
            Tag::FreePart => LogRecord::FreePart {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                part_num: PartNum::decode(reader)?,
            },
            Tag::UndoAllocPart => LogRecord::UndoAllocPart {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                undo_next_lsn: Lsn::decode(reader)?,
                part_num: PartNum::decode(reader)?,
            },
            Tag::UndoFreePart => LogRecord::UndoFreePart {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
                undo_next_lsn: Lsn::decode(reader)?,
                part_num: PartNum::decode(reader)?,
            },
            Tag::Commit => LogRecord::Commit {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
            },
            Tag::Abort => LogRecord::Abort {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
            },
            Tag::End => LogRecord::End {
                lsn: Lsn::decode(reader)?,
                transaction_num: TransactionNum::decode(reader)?,
                prev_lsn: Lsn::decode(reader)?,
            },
        })
    }
}
