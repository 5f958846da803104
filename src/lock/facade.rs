//! `LockFacade` (spec.md §4.4): a declarative "make sure I hold at least
//! this much" API on top of `LockContext`, so callers never have to hand
//! -roll the acquire/promote/escalate decision tree themselves.

use std::sync::Arc;

use crate::error::LockResult;
use crate::transaction::Transaction;

use super::context::LockContext;
use super::mode::LockMode;

pub struct LockFacade;

impl LockFacade {
    /// Walk from the root down to `ctx`, taking the intent lock each
    /// ancestor needs to support a `mode` lock at `ctx`, then ensure
    /// `ctx` itself holds at least `mode`.
    ///
    /// - If `ctx`'s effective mode already substitutes `mode`, this is a
    ///   no-op.
    /// - If `ctx` holds nothing yet, it is acquired directly.
    /// - If `ctx` holds a weaker mode, it is promoted.
    ///
    /// Follows spec.md §4.4's three branches in order: `IX` held with `S`
    /// needed promotes straight to `SIX`; any other intent mode held
    /// escalates first (falling back to a direct promote if escalation
    /// alone isn't enough); otherwise ancestors are brought up to
    /// `parentLockOf(mode)` before `ctx` itself is acquired or promoted.
    pub fn ensure_sufficient(ctx: &Arc<LockContext>, tx: &Arc<Transaction>, mode: LockMode) -> LockResult<()> {
        if LockMode::substitutable(ctx.effective_mode(tx), mode) {
            return Ok(());
        }

        let held = ctx.explicit_mode(tx);

        if held == LockMode::IX && mode == LockMode::S {
            return ctx.promote(tx, LockMode::SIX);
        }

        if held.is_intent() {
            ctx.escalate(tx)?;
            if !LockMode::substitutable(ctx.explicit_mode(tx), mode) {
                return ctx.promote(tx, mode);
            }
            return Ok(());
        }

        if let Some(parent) = ctx.parent() {
            let intent = LockMode::parent_lock_of(mode);
            if intent != LockMode::NL {
                Self::ensure_sufficient(&parent, tx, intent)?;
            }
        }

        if held == LockMode::NL {
            ctx.acquire(tx, mode)
        } else if LockMode::substitutable(held, mode) {
            Ok(())
        } else {
            ctx.promote(tx, Self::upgrade_target(held, mode))
        }
    }

    /// The mode to request when upgrading from `held` towards at least
    /// `need`: `SIX` when the combination needs both S and X semantics,
    /// otherwise `need` itself.
    fn upgrade_target(held: LockMode, need: LockMode) -> LockMode {
        use LockMode::*;
        match (held, need) {
            (IX, S) | (S, IX) => SIX,
            _ => need,
        }
    }
}
