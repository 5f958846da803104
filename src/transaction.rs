//! The `Transaction` collaborator (spec.md §6).
//!
//! A transaction is owned by exactly one OS thread at a time (spec.md
//! §5's scheduling model). Blocking it parks that thread; the
//! `prepare_block`/`block`/`unblock` handshake is the only way the lock
//! table is allowed to block a caller, closing the lost-wakeup race the
//! teacher crate's busy-wait polling (`concurrent_status.rs`) was prone
//! to (see DESIGN.md).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::Thread;

use parking_lot::Mutex;

use crate::codec::{Decode, Encode};

pub type TransactionNum = u64;

static NEXT_TRANSACTION_NUM: AtomicU64 = AtomicU64::new(1);

/// Transaction status lattice (spec.md §4.7). Transitions only ever move
/// forward along this lattice; nothing regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Running,
    Committing,
    Aborting,
    /// Entered only during restart analysis, for a transaction that was
    /// `Running` at crash time.
    RecoveryAborting,
    Complete,
}

impl Encode for TransactionStatus {
    fn encode(&self, buf: &mut Vec<u8>) {
        let tag: u8 = match self {
            TransactionStatus::Running => 0,
            TransactionStatus::Committing => 1,
            TransactionStatus::Aborting => 2,
            TransactionStatus::RecoveryAborting => 3,
            TransactionStatus::Complete => 4,
        };
        tag.encode(buf);
    }
}

impl Decode for TransactionStatus {
    fn decode(reader: &mut impl std::io::Read) -> crate::codec::DecodeResult<Self> {
        Ok(match u8::decode(reader)? {
            0 => TransactionStatus::Running,
            1 => TransactionStatus::Committing,
            2 => TransactionStatus::Aborting,
            3 => TransactionStatus::RecoveryAborting,
            4 => TransactionStatus::Complete,
            other => return Err(crate::codec::DecodeError::InvalidTag(other)),
        })
    }
}

pub struct Transaction {
    transaction_num: TransactionNum,
    status: Mutex<TransactionStatus>,
    parked_thread: Mutex<Option<Thread>>,
}

impl Transaction {
    pub fn new() -> Self {
        let transaction_num = NEXT_TRANSACTION_NUM.fetch_add(1, Ordering::Relaxed);
        Self::with_num(transaction_num)
    }

    /// Construct a transaction with an explicit number, used by recovery
    /// when it materializes a transaction that was active at crash time.
    pub fn with_num(transaction_num: TransactionNum) -> Self {
        Self {
            transaction_num,
            status: Mutex::new(TransactionStatus::Running),
            parked_thread: Mutex::new(None),
        }
    }

    pub fn get_transaction_num(&self) -> TransactionNum {
        self.transaction_num
    }

    pub fn get_status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    /// Record this thread as the one to wake, while still inside the
    /// lock table's critical section. Must be called before leaving the
    /// section and before `block`.
    pub fn prepare_block(&self) {
        *self.parked_thread.lock() = Some(std::thread::current());
    }

    /// Park the calling thread. Must be called outside the lock table's
    /// critical section. Returns once `unblock` has been called for this
    /// transaction, whether that happened before or after this call
    /// (`std::thread::park` carries a permit, so an `unblock` that beats
    /// `block` is absorbed rather than lost).
    pub fn block(&self) {
        std::thread::park();
        *self.parked_thread.lock() = None;
    }

    /// Wake the transaction's parked thread, if any is currently
    /// prepared. Idempotent: calling it with no prepared thread is a
    /// no-op, calling it twice just pre-loads a permit that the next
    /// `block` consumes immediately.
    pub fn unblock(&self) {
        if let Some(thread) = self.parked_thread.lock().clone() {
            thread.unpark();
        }
    }

    /// Drop transaction-local bookkeeping. Lock/log state cleanup is the
    /// caller's (RecoveryManager's / LockManager's) responsibility.
    pub fn cleanup(&self) {
        *self.parked_thread.lock() = None;
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx{}", self.transaction_num)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx{}", self.transaction_num)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.transaction_num == other.transaction_num
    }
}
impl Eq for Transaction {}

impl std::hash::Hash for Transaction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.transaction_num.hash(state);
    }
}
