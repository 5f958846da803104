//! The hierarchical wrapper around `LockTable` (spec.md §4.3): a tree of
//! lock contexts (database → table → page → record) that enforces
//! intention-lock discipline, promotion, and escalation on top of the
//! flat lock table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{LockError, LockResult};
use crate::transaction::{Transaction, TransactionNum};

use super::mode::LockMode;
use super::resource::ResourceName;
use super::table::LockTable;

pub struct LockContext {
    resource: ResourceName,
    parent: Option<Weak<LockContext>>,
    children: Mutex<HashMap<String, Arc<LockContext>>>,
    /// Per-transaction count of descendant contexts at which the
    /// transaction holds a non-`NL` lock (invariant I4).
    num_child_locks: Mutex<HashMap<TransactionNum, usize>>,
    readonly: AtomicBool,
    /// New children are born readonly once this is set.
    disable_children: AtomicBool,
    table: Arc<LockTable>,
}

impl LockContext {
    pub fn root(table: Arc<LockTable>) -> Arc<Self> {
        Arc::new(Self {
            resource: ResourceName::root(),
            parent: None,
            children: Mutex::new(HashMap::new()),
            num_child_locks: Mutex::new(HashMap::new()),
            readonly: AtomicBool::new(false),
            disable_children: AtomicBool::new(false),
            table,
        })
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn parent(&self) -> Option<Arc<LockContext>> {
        self.parent_ctx()
    }

    /// Look up (lazily creating and caching) the child context named
    /// `name`. Safe under concurrent lookup from multiple threads.
    pub fn child(self: &Arc<Self>, name: impl Into<String>) -> Arc<LockContext> {
        let name = name.into();
        let mut children = self.children.lock();
        children
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(LockContext {
                    resource: self.resource.child(&name),
                    parent: Some(Arc::downgrade(self)),
                    children: Mutex::new(HashMap::new()),
                    num_child_locks: Mutex::new(HashMap::new()),
                    readonly: AtomicBool::new(self.disable_children.load(Ordering::SeqCst)),
                    disable_children: AtomicBool::new(false),
                    table: self.table.clone(),
                })
            })
            .clone()
    }

    /// From now on, children created under this context are born
    /// read-only (existing children and this context itself are
    /// unaffected).
    pub fn disable_child_locks(&self) {
        self.disable_children.store(true, Ordering::SeqCst);
    }

    fn parent_ctx(&self) -> Option<Arc<LockContext>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn ancestors(&self) -> Vec<Arc<LockContext>> {
        let mut out = vec![];
        let mut cur = self.parent_ctx();
        while let Some(ctx) = cur {
            cur = ctx.parent_ctx();
            out.push(ctx);
        }
        out
    }

    fn adjust_count(&self, tx: TransactionNum, delta: i64) {
        let mut counts = self.num_child_locks.lock();
        let entry = counts.entry(tx).or_insert(0);
        *entry = (*entry as i64 + delta).max(0) as usize;
        if *entry == 0 {
            counts.remove(&tx);
        }
    }

    fn adjust_ancestor_counts(&self, tx: TransactionNum, delta: i64) {
        for anc in self.ancestors() {
            anc.adjust_count(tx, delta);
        }
    }

    /// Walk from `from`'s parent up to (and including) `self`, adjusting
    /// each visited context's descendant count. Used when a promotion or
    /// escalation releases a descendant out from under `self`: only the
    /// path between the descendant and `self` is affected, contexts above
    /// `self` never change because `self` keeps holding a non-`NL` lock
    /// throughout.
    fn adjust_path_up_to_self(&self, from: &Arc<LockContext>, tx: TransactionNum, delta: i64) {
        let mut cur = from.parent_ctx();
        while let Some(ctx) = cur {
            ctx.adjust_count(tx, delta);
            if ctx.resource == self.resource {
                break;
            }
            cur = ctx.parent_ctx();
        }
    }

    /// All currently-materialized descendant contexts at which `tx` holds
    /// a lock matching `pred`.
    fn collect_descendants(
        self: &Arc<Self>,
        tx: TransactionNum,
        pred: impl Fn(LockMode) -> bool + Copy,
    ) -> Vec<Arc<LockContext>> {
        let children: Vec<Arc<LockContext>> = self.children.lock().values().cloned().collect();
        let mut out = vec![];
        for child in children {
            let mode = self.table.mode_held_by(tx, &child.resource);
            if pred(mode) {
                out.push(child.clone());
            }
            out.extend(child.collect_descendants(tx, pred));
        }
        out
    }

    pub fn acquire(self: &Arc<Self>, tx: &Arc<Transaction>, mode: LockMode) -> LockResult<()> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(LockError::ReadonlyContext {
                resource: self.resource.clone(),
            });
        }

        let tx_num = tx.get_transaction_num();

        if let Some(parent) = self.parent_ctx() {
            let parent_held = self.table.mode_held_by(tx_num, &parent.resource);
            if !LockMode::can_be_parent_lock(parent_held, mode) {
                return Err(LockError::InvalidLock {
                    resource: self.resource.clone(),
                    reason: format!(
                        "parent {} holds {} which cannot parent a {} lock",
                        parent.resource, parent_held, mode
                    ),
                });
            }
        }

        if matches!(mode, LockMode::S | LockMode::IS) {
            for anc in self.ancestors() {
                if self.table.mode_held_by(tx_num, &anc.resource) == LockMode::SIX {
                    return Err(LockError::InvalidLock {
                        resource: self.resource.clone(),
                        reason: format!("redundant under ancestor {} which holds SIX", anc.resource),
                    });
                }
            }
        }

        self.table.acquire(tx, &self.resource, mode)?;
        if mode != LockMode::NL {
            self.adjust_ancestor_counts(tx_num, 1);
        }
        Ok(())
    }

    pub fn release(self: &Arc<Self>, tx: &Arc<Transaction>) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        {
            let counts = self.num_child_locks.lock();
            if counts.get(&tx_num).copied().unwrap_or(0) > 0 {
                return Err(LockError::InvalidLock {
                    resource: self.resource.clone(),
                    reason: "descendant locks are still held".to_string(),
                });
            }
        }
        self.table.release(tx, &self.resource)?;
        self.adjust_ancestor_counts(tx_num, -1);
        Ok(())
    }

    pub fn promote(self: &Arc<Self>, tx: &Arc<Transaction>, new_mode: LockMode) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let held = self.table.mode_held_by(tx_num, &self.resource);

        if held == new_mode {
            return Err(LockError::DuplicateLockRequest {
                tx: tx_num,
                resource: self.resource.clone(),
            });
        }
        if held == LockMode::NL {
            return Err(LockError::NoLockHeld {
                tx: tx_num,
                resource: self.resource.clone(),
            });
        }

        let plain_ok = LockMode::substitutable(new_mode, held);
        let six_upgrade = new_mode == LockMode::SIX && matches!(held, LockMode::IS | LockMode::IX | LockMode::S);
        if !plain_ok && !six_upgrade {
            return Err(LockError::InvalidLock {
                resource: self.resource.clone(),
                reason: format!("{} does not substitute held mode {}", new_mode, held),
            });
        }

        if new_mode == LockMode::SIX {
            for anc in self.ancestors() {
                if self.table.mode_held_by(tx_num, &anc.resource) == LockMode::SIX {
                    return Err(LockError::InvalidLock {
                        resource: self.resource.clone(),
                        reason: format!("redundant SIX under ancestor {} which holds SIX", anc.resource),
                    });
                }
            }

            let sis_descendants = self.collect_descendants(tx_num, |m| matches!(m, LockMode::S | LockMode::IS));
            let mut release_set: Vec<ResourceName> = sis_descendants.iter().map(|c| c.resource.clone()).collect();
            release_set.push(self.resource.clone());

            self.table
                .acquire_and_release(tx, &self.resource, LockMode::SIX, &release_set)?;

            for descendant in &sis_descendants {
                self.adjust_path_up_to_self(descendant, tx_num, -1);
            }
            return Ok(());
        }

        self.table.promote(tx, &self.resource, new_mode)
    }

    pub fn escalate(self: &Arc<Self>, tx: &Arc<Transaction>) -> LockResult<()> {
        let tx_num = tx.get_transaction_num();
        let held = self.table.mode_held_by(tx_num, &self.resource);

        if held == LockMode::NL {
            return Err(LockError::NoLockHeld {
                tx: tx_num,
                resource: self.resource.clone(),
            });
        }
        if matches!(held, LockMode::S | LockMode::X) {
            return Ok(());
        }

        let descendants = self.collect_descendants(tx_num, |m| m != LockMode::NL);
        let target = if descendants
            .iter()
            .any(|d| matches!(self.table.mode_held_by(tx_num, &d.resource), LockMode::X | LockMode::IX | LockMode::SIX))
        {
            LockMode::X
        } else {
            LockMode::S
        };

        let mut release_set: Vec<ResourceName> = descendants.iter().map(|c| c.resource.clone()).collect();
        release_set.push(self.resource.clone());

        self.table.acquire_and_release(tx, &self.resource, target, &release_set)?;

        for descendant in &descendants {
            self.adjust_path_up_to_self(descendant, tx_num, -1);
        }
        Ok(())
    }

    /// The strongest mode in effect at this node: its own explicit mode
    /// if non-`NL`, else the strongest implied mode from an ancestor's
    /// explicit `S`/`SIX`/`X`. Ancestor intent locks imply nothing here.
    pub fn effective_mode(&self, tx: &Arc<Transaction>) -> LockMode {
        let tx_num = tx.get_transaction_num();
        let explicit = self.table.mode_held_by(tx_num, &self.resource);
        if explicit != LockMode::NL {
            return explicit;
        }
        let mut cur = self.parent_ctx();
        while let Some(anc) = cur {
            match self.table.mode_held_by(tx_num, &anc.resource) {
                LockMode::S | LockMode::SIX => return LockMode::S,
                LockMode::X => return LockMode::X,
                _ => {}
            }
            cur = anc.parent_ctx();
        }
        LockMode::NL
    }

    pub fn explicit_mode(&self, tx: &Arc<Transaction>) -> LockMode {
        self.table.mode_held_by(tx.get_transaction_num(), &self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> Arc<Transaction> {
        Arc::new(Transaction::new())
    }

    fn tree() -> (Arc<LockTable>, Arc<LockContext>) {
        let table = Arc::new(LockTable::new());
        let root = LockContext::root(table.clone());
        (table, root)
    }

    #[test]
    fn acquire_requires_matching_parent_intent() {
        let (_table, root) = tree();
        let db = root.child("db");
        let table_ctx = db.child("t");
        // no IX/IS at db yet: X at the table must fail
        assert!(matches!(
            table_ctx.acquire(&tx(), LockMode::X).unwrap_err(),
            LockError::InvalidLock { .. }
        ));
    }

    #[test]
    fn promotion_to_six_releases_redundant_descendants() {
        let (_table, root) = tree();
        let db = root.child("db");
        let t = db.child("t");
        let page1 = t.child("page1");
        let page2 = t.child("page2");
        let tx1 = tx();

        root.acquire(&tx1, LockMode::IX).unwrap();
        db.acquire(&tx1, LockMode::IX).unwrap();
        t.acquire(&tx1, LockMode::IS).unwrap();
        page1.acquire(&tx1, LockMode::S).unwrap();
        page2.acquire(&tx1, LockMode::IS).unwrap();

        t.promote(&tx1, LockMode::SIX).unwrap();

        assert_eq!(t.explicit_mode(&tx1), LockMode::SIX);
        assert_eq!(page1.explicit_mode(&tx1), LockMode::NL);
        assert_eq!(page2.explicit_mode(&tx1), LockMode::NL);
    }

    #[test]
    fn escalate_chooses_exclusive_when_a_descendant_holds_exclusive() {
        let (_table, root) = tree();
        let db = root.child("db");
        let t = db.child("t");
        let p1 = t.child("p1");
        let p2 = t.child("p2");
        let p3 = t.child("p3");
        let tx1 = tx();

        root.acquire(&tx1, LockMode::IX).unwrap();
        db.acquire(&tx1, LockMode::IX).unwrap();
        t.acquire(&tx1, LockMode::IX).unwrap();
        p1.acquire(&tx1, LockMode::S).unwrap();
        p3.acquire(&tx1, LockMode::X).unwrap();
        p2.acquire(&tx1, LockMode::IS).unwrap();

        t.escalate(&tx1).unwrap();

        assert_eq!(t.explicit_mode(&tx1), LockMode::X);
        assert_eq!(p1.explicit_mode(&tx1), LockMode::NL);
        assert_eq!(p2.explicit_mode(&tx1), LockMode::NL);
        assert_eq!(p3.explicit_mode(&tx1), LockMode::NL);
    }

    #[test]
    fn release_is_forbidden_while_descendant_locks_held() {
        let (_table, root) = tree();
        let db = root.child("db");
        let t = db.child("t");
        let tx1 = tx();

        root.acquire(&tx1, LockMode::IX).unwrap();
        db.acquire(&tx1, LockMode::IX).unwrap();
        t.acquire(&tx1, LockMode::X).unwrap();

        assert!(matches!(
            db.release(&tx1).unwrap_err(),
            LockError::InvalidLock { .. }
        ));
        t.release(&tx1).unwrap();
        db.release(&tx1).unwrap();
    }

    #[test]
    fn effective_mode_walks_ancestors_but_ignores_intent() {
        let (_table, root) = tree();
        let db = root.child("db");
        let t = db.child("t");
        let p = t.child("p");
        let tx1 = tx();

        root.acquire(&tx1, LockMode::IX).unwrap();
        db.acquire(&tx1, LockMode::IX).unwrap();
        t.acquire(&tx1, LockMode::X).unwrap();

        assert_eq!(p.effective_mode(&tx1), LockMode::X);
        assert_eq!(db.effective_mode(&tx1), LockMode::IX);
    }
}
