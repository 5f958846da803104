//! The lock mode algebra (spec.md §3, §4.1): a pure, stateless set of
//! tables over the six-element mode enum. Every other component consults
//! these tables; none of them hold state of their own.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    NL,
    IS,
    IX,
    S,
    SIX,
    X,
}

use LockMode::*;

const ALL_MODES: [LockMode; 6] = [NL, IS, IX, S, SIX, X];

impl LockMode {
    /// `true` for the three intent modes.
    pub fn is_intent(self) -> bool {
        matches!(self, IS | IX | SIX)
    }

    /// Symmetric compatibility table (spec.md §3). `held` is a mode
    /// already granted on a resource; `requested` is a mode some
    /// transaction wants to add.
    pub fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (NL, _) | (_, NL) => true,
            (IS, IS) | (IS, IX) | (IS, S) | (IS, SIX) => true,
            (IS, X) => false,
            (IX, IS) | (IX, IX) => true,
            (IX, S) | (IX, SIX) | (IX, X) => false,
            (S, IS) | (S, S) => true,
            (S, IX) | (S, SIX) | (S, X) => false,
            (SIX, IS) => true,
            (SIX, IX) | (SIX, S) | (SIX, SIX) | (SIX, X) => false,
            (X, _) => false,
        }
    }

    /// Can a holder of `hold` act as if it held `need`?  Reflexive.
    pub fn substitutable(hold: LockMode, need: LockMode) -> bool {
        use LockMode::*;
        match hold {
            NL => matches!(need, NL),
            S => matches!(need, NL | S),
            IS => matches!(need, NL | IS),
            IX => matches!(need, NL | IS | IX),
            SIX => matches!(need, NL | IS | IX | S | SIX),
            X => true,
        }
    }

    /// The minimum intent mode a parent must hold for `child` to be
    /// granted beneath it.
    pub fn parent_lock_of(child: LockMode) -> LockMode {
        use LockMode::*;
        match child {
            NL => NL,
            S | IS => IS,
            X | IX | SIX => IX,
        }
    }

    /// Tabular check used during acquire: does the parent's held mode
    /// `parent` permit a child lock of mode `child` beneath it?
    pub fn can_be_parent_lock(parent: LockMode, child: LockMode) -> bool {
        Self::substitutable(parent, Self::parent_lock_of(child))
    }

    pub fn all() -> &'static [LockMode; 6] {
        &ALL_MODES
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            NL => "NL",
            IS => "IS",
            IX => "IX",
            S => "S",
            SIX => "SIX",
            X => "X",
        };
        write!(f, "{}", s)
    }
}
