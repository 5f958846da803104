//! The flat per-resource lock table (spec.md §4.2): lock lists and FIFO
//! wait queues, with atomic acquire/release under a single critical
//! section (spec.md §5).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LockError, LockResult};
use crate::transaction::{Transaction, TransactionNum};

use super::mode::LockMode;
use super::resource::ResourceName;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: ResourceName,
    pub mode: LockMode,
    pub transaction: TransactionNum,
}

/// A blocked request. Carries the handle needed to wake the waiter's
/// thread and the releases that ride along with its eventual grant.
struct Waiter {
    tx: Arc<Transaction>,
    mode: LockMode,
    release_on_grant: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Grant order; an in-place mode update does not change a lock's
    /// position here.
    granted: Vec<Lock>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Resource acquisition order per transaction, for `locks_of`.
    tx_order: HashMap<TransactionNum, Vec<ResourceName>>,
}

impl Inner {
    fn mode_held_by(&self, tx: TransactionNum, resource: &ResourceName) -> LockMode {
        self.resources
            .get(resource)
            .and_then(|e| e.granted.iter().find(|l| l.transaction == tx))
            .map(|l| l.mode)
            .unwrap_or(LockMode::NL)
    }

    fn is_compatible_with_others(&self, tx: TransactionNum, resource: &ResourceName, mode: LockMode) -> bool {
        self.resources.get(resource).is_none_or(|e| {
            e.granted
                .iter()
                .all(|l| l.transaction == tx || LockMode::compatible(l.mode, mode))
        })
    }

    fn queue_nonempty(&self, resource: &ResourceName) -> bool {
        self.resources.get(resource).is_some_and(|e| !e.waiters.is_empty())
    }

    /// Grant `mode` to `tx` on `resource`, replacing any existing grant in
    /// place (grant order is preserved) or appending a new entry.
    fn grant(&mut self, resource: &ResourceName, tx: TransactionNum, mode: LockMode) {
        let entry = self.resources.entry(resource.clone()).or_default();
        if let Some(existing) = entry.granted.iter_mut().find(|l| l.transaction == tx) {
            existing.mode = mode;
        } else {
            entry.granted.push(Lock {
                resource: resource.clone(),
                mode,
                transaction: tx,
            });
            self.tx_order.entry(tx).or_default().push(resource.clone());
        }
    }

    fn remove_lock(&mut self, resource: &ResourceName, tx: TransactionNum) {
        if let Some(entry) = self.resources.get_mut(resource) {
            entry.granted.retain(|l| l.transaction != tx);
        }
        if let Some(order) = self.tx_order.get_mut(&tx) {
            order.retain(|r| r != resource);
        }
    }

    fn enqueue_back(&mut self, resource: &ResourceName, waiter: Waiter) {
        self.resources.entry(resource.clone()).or_default().waiters.push_back(waiter);
    }

    fn enqueue_front(&mut self, resource: &ResourceName, waiter: Waiter) {
        self.resources.entry(resource.clone()).or_default().waiters.push_front(waiter);
    }

    /// Walk `resource`'s waiters front to back, granting every request
    /// that is currently compatible and stopping at the first one that
    /// is not (strict FIFO head-of-line, no skipping ahead).
    fn drain(&mut self, resource: &ResourceName, worklist: &mut VecDeque<ResourceName>) {
        loop {
            let head = match self.resources.get(resource) {
                Some(e) => e.waiters.front().map(|w| (w.tx.clone(), w.mode)),
                None => None,
            };
            let (tx, mode) = match head {
                Some(v) => v,
                None => return,
            };
            let tx_num = tx.get_transaction_num();
            if !self.is_compatible_with_others(tx_num, resource, mode) {
                return;
            }

            let waiter = self
                .resources
                .get_mut(resource)
                .and_then(|e| e.waiters.pop_front())
                .expect("head checked above");

            self.grant(resource, tx_num, waiter.mode);
            for released in &waiter.release_on_grant {
                if released != resource {
                    self.remove_lock(released, tx_num);
                    if !worklist.contains(released) {
                        worklist.push_back(released.clone());
                    }
                }
            }
            waiter.tx.unblock();
        }
    }

    fn process_worklist(&mut self, mut worklist: VecDeque<ResourceName>) {
        while let Some(resource) = worklist.pop_front() {
            self.drain(&resource, &mut worklist);
        }
    }
}

pub struct LockTable {
    inner: Mutex<Inner>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Block until `mode` is granted on `resource`, or fail immediately
    /// with `DuplicateLockRequest` if `tx` already holds a lock there.
    pub fn acquire(&self, tx: &Arc<Transaction>, resource: &ResourceName, mode: LockMode) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let blocked = {
            let mut inner = self.inner.lock();
            if inner.mode_held_by(tx_num, resource) != LockMode::NL {
                return Err(LockError::DuplicateLockRequest {
                    tx: tx_num,
                    resource: resource.clone(),
                });
            }

            if inner.queue_nonempty(resource) || !inner.is_compatible_with_others(tx_num, resource, mode) {
                inner.enqueue_back(
                    resource,
                    Waiter {
                        tx: tx.clone(),
                        mode,
                        release_on_grant: vec![],
                    },
                );
                tx.prepare_block();
                true
            } else {
                inner.grant(resource, tx_num, mode);
                false
            }
        };
        if blocked {
            tx.block();
        }
        Ok(())
    }

    /// Atomically grant `mode` on `resource` and release every resource in
    /// `release_set` other than `resource` itself. `resource` may already
    /// be held by `tx` iff it appears in `release_set` (the promotion
    /// case); every other name in `release_set` must already be held.
    pub fn acquire_and_release(
        &self,
        tx: &Arc<Transaction>,
        resource: &ResourceName,
        mode: LockMode,
        release_set: &[ResourceName],
    ) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let blocked = {
            let mut inner = self.inner.lock();

            let already_held = inner.mode_held_by(tx_num, resource) != LockMode::NL;
            if already_held && !release_set.contains(resource) {
                return Err(LockError::DuplicateLockRequest {
                    tx: tx_num,
                    resource: resource.clone(),
                });
            }
            for r in release_set {
                if inner.mode_held_by(tx_num, r) == LockMode::NL {
                    return Err(LockError::NoLockHeld {
                        tx: tx_num,
                        resource: r.clone(),
                    });
                }
            }

            if inner.is_compatible_with_others(tx_num, resource, mode) {
                inner.grant(resource, tx_num, mode);
                let mut worklist = VecDeque::new();
                for r in release_set {
                    if r != resource {
                        inner.remove_lock(r, tx_num);
                        worklist.push_back(r.clone());
                    }
                }
                inner.process_worklist(worklist);
                false
            } else {
                inner.enqueue_front(
                    resource,
                    Waiter {
                        tx: tx.clone(),
                        mode,
                        release_on_grant: release_set.to_vec(),
                    },
                );
                tx.prepare_block();
                true
            }
        };
        if blocked {
            tx.block();
        }
        Ok(())
    }

    pub fn release(&self, tx: &Arc<Transaction>, resource: &ResourceName) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let mut inner = self.inner.lock();
        if inner.mode_held_by(tx_num, resource) == LockMode::NL {
            return Err(LockError::NoLockHeld {
                tx: tx_num,
                resource: resource.clone(),
            });
        }
        inner.remove_lock(resource, tx_num);
        let mut worklist = VecDeque::new();
        worklist.push_back(resource.clone());
        inner.process_worklist(worklist);
        Ok(())
    }

    /// Upgrade the mode held on `resource` to `new_mode`. Requires
    /// `substitutable(new_mode, held)` and `new_mode != held`.
    pub fn promote(&self, tx: &Arc<Transaction>, resource: &ResourceName, new_mode: LockMode) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let blocked = {
            let mut inner = self.inner.lock();
            let held = inner.mode_held_by(tx_num, resource);
            if held == LockMode::NL {
                return Err(LockError::NoLockHeld {
                    tx: tx_num,
                    resource: resource.clone(),
                });
            }
            if held == new_mode {
                return Err(LockError::DuplicateLockRequest {
                    tx: tx_num,
                    resource: resource.clone(),
                });
            }
            if !LockMode::substitutable(new_mode, held) {
                return Err(LockError::InvalidLock {
                    resource: resource.clone(),
                    reason: format!("{} does not substitute held mode {}", new_mode, held),
                });
            }

            if inner.is_compatible_with_others(tx_num, resource, new_mode) {
                inner.grant(resource, tx_num, new_mode);
                false
            } else {
                inner.enqueue_front(
                    resource,
                    Waiter {
                        tx: tx.clone(),
                        mode: new_mode,
                        release_on_grant: vec![],
                    },
                );
                tx.prepare_block();
                true
            }
        };
        if blocked {
            tx.block();
        }
        Ok(())
    }

    pub fn locks_on(&self, resource: &ResourceName) -> Vec<Lock> {
        self.inner
            .lock()
            .resources
            .get(resource)
            .map(|e| e.granted.clone())
            .unwrap_or_default()
    }

    pub fn locks_of(&self, tx: TransactionNum) -> Vec<Lock> {
        let inner = self.inner.lock();
        let order = inner.tx_order.get(&tx).cloned().unwrap_or_default();
        order
            .iter()
            .filter_map(|r| {
                inner
                    .resources
                    .get(r)
                    .and_then(|e| e.granted.iter().find(|l| l.transaction == tx).cloned())
            })
            .collect()
    }

    pub fn mode_held_by(&self, tx: TransactionNum, resource: &ResourceName) -> LockMode {
        self.inner.lock().mode_held_by(tx, resource)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn tx() -> Arc<Transaction> {
        Arc::new(Transaction::new())
    }

    #[test]
    fn acquire_grants_immediately_when_uncontended() {
        let table = LockTable::new();
        let t1 = tx();
        let r = ResourceName::new(["db"]);
        table.acquire(&t1, &r, LockMode::X).unwrap();
        assert_eq!(table.mode_held_by(t1.get_transaction_num(), &r), LockMode::X);
    }

    #[test]
    fn duplicate_acquire_is_rejected() {
        let table = LockTable::new();
        let t1 = tx();
        let r = ResourceName::new(["db"]);
        table.acquire(&t1, &r, LockMode::S).unwrap();
        let err = table.acquire(&t1, &r, LockMode::S).unwrap_err();
        assert!(matches!(err, LockError::DuplicateLockRequest { .. }));
    }

    #[test]
    fn release_of_unheld_lock_is_rejected() {
        let table = LockTable::new();
        let t1 = tx();
        let r = ResourceName::new(["db"]);
        let err = table.release(&t1, &r).unwrap_err();
        assert!(matches!(err, LockError::NoLockHeld { .. }));
    }

    #[test]
    fn fifo_grants_first_waiter_before_second_regardless_of_compatibility() {
        let table = Arc::new(LockTable::new());
        let r = ResourceName::new(["db"]);
        let holder = tx();
        table.acquire(&holder, &r, LockMode::X).unwrap();

        let t1 = tx();
        let t2 = tx();
        let order: Arc<Mutex<Vec<TransactionNum>>> = Arc::new(Mutex::new(vec![]));

        let table1 = table.clone();
        let t1c = t1.clone();
        let order1 = order.clone();
        let h1 = thread::spawn(move || {
            table1.acquire(&t1c, &ResourceName::new(["db"]), LockMode::S).unwrap();
            order1.lock().push(t1c.get_transaction_num());
        });

        // give t1 time to enqueue before t2 does, so FIFO order is deterministic
        thread::sleep(Duration::from_millis(50));

        let table2 = table.clone();
        let t2c = t2.clone();
        let order2 = order.clone();
        let h2 = thread::spawn(move || {
            table2.acquire(&t2c, &ResourceName::new(["db"]), LockMode::S).unwrap();
            order2.lock().push(t2c.get_transaction_num());
        });

        thread::sleep(Duration::from_millis(50));
        table.release(&holder, &r).unwrap();

        h1.join().unwrap();
        h2.join().unwrap();

        let observed = order.lock().clone();
        assert_eq!(observed, vec![t1.get_transaction_num(), t2.get_transaction_num()]);
    }

    #[test]
    fn strict_queue_stops_at_first_ungrantable_waiter() {
        // queue = [S(T1), X(T2), S(T3)] behind a holder; on release only T1
        // is drained, T2 blocks further progress even though T3's S would
        // be compatible with T1 alone.
        let table = Arc::new(LockTable::new());
        let r = ResourceName::new(["db"]);
        let holder = tx();
        table.acquire(&holder, &r, LockMode::X).unwrap();

        let t1 = tx();
        let t2 = tx();
        let t3 = tx();

        let granted: Arc<Mutex<Vec<TransactionNum>>> = Arc::new(Mutex::new(vec![]));

        let spawn_waiter = |tbl: Arc<LockTable>, t: Arc<Transaction>, mode: LockMode, granted: Arc<Mutex<Vec<TransactionNum>>>| {
            let r = ResourceName::new(["db"]);
            thread::spawn(move || {
                tbl.acquire(&t, &r, mode).unwrap();
                granted.lock().push(t.get_transaction_num());
            })
        };

        let h1 = spawn_waiter(table.clone(), t1.clone(), LockMode::S, granted.clone());
        thread::sleep(Duration::from_millis(30));
        let h2 = spawn_waiter(table.clone(), t2.clone(), LockMode::X, granted.clone());
        thread::sleep(Duration::from_millis(30));
        let h3 = spawn_waiter(table.clone(), t3.clone(), LockMode::S, granted.clone());
        thread::sleep(Duration::from_millis(30));

        table.release(&holder, &r).unwrap();
        // give the drain a moment to run; only T1 should have been granted
        thread::sleep(Duration::from_millis(100));
        assert_eq!(granted.lock().clone(), vec![t1.get_transaction_num()]);

        // unblock the rest so the test doesn't leak parked threads
        table.release(&t1, &r).unwrap();
        h2.join().unwrap();
        table.release(&t2, &r).unwrap();
        h3.join().unwrap();
        h1.join().unwrap();
    }

    #[test]
    fn acquire_and_release_is_atomic_for_promotion_with_cleanup() {
        // T holds S(page1), IS(page2); promoting the table to SIX releases
        // both descendants atomically.
        let table = LockTable::new();
        let t = tx();
        let page1 = ResourceName::new(["db", "t", "page1"]);
        let page2 = ResourceName::new(["db", "t", "page2"]);
        let tbl = ResourceName::new(["db", "t"]);

        table.acquire(&t, &tbl, LockMode::IX).unwrap();
        table.acquire(&t, &page1, LockMode::S).unwrap();
        table.acquire(&t, &page2, LockMode::IS).unwrap();

        table
            .acquire_and_release(&t, &tbl, LockMode::SIX, &[tbl.clone(), page1.clone(), page2.clone()])
            .unwrap();

        assert_eq!(table.mode_held_by(t.get_transaction_num(), &tbl), LockMode::SIX);
        assert_eq!(table.mode_held_by(t.get_transaction_num(), &page1), LockMode::NL);
        assert_eq!(table.mode_held_by(t.get_transaction_num(), &page2), LockMode::NL);
    }

    #[test]
    fn promote_requires_substitutable_and_different_mode() {
        let table = LockTable::new();
        let t = tx();
        let r = ResourceName::new(["db"]);
        table.acquire(&t, &r, LockMode::S).unwrap();

        assert!(matches!(
            table.promote(&t, &r, LockMode::S).unwrap_err(),
            LockError::DuplicateLockRequest { .. }
        ));
        assert!(matches!(
            table.promote(&t, &r, LockMode::IS).unwrap_err(),
            LockError::InvalidLock { .. }
        ));
        table.promote(&t, &r, LockMode::X).unwrap();
        assert_eq!(table.mode_held_by(t.get_transaction_num(), &r), LockMode::X);
    }
}
