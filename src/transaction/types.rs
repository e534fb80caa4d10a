// Core transaction and locking types.
//
// Everything here is plain data: the status state machine, the lock mode
// lattice, and the names locks attach to. The managers own the behavior.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::TransactionId;

/// Transaction lifecycle status.
///
/// Legal transitions:
///
/// ```text
/// Running -> Committing       -> Complete
/// Running -> Aborting         -> Complete
/// Running -> RecoveryAborting -> Complete   (restart only)
/// *       -> Complete                       (end-record emission)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Actively executing operations.
    Running,
    /// Commit record written and durable; end record pending.
    Committing,
    /// Abort record written; rollback happens at end.
    Aborting,
    /// Marked for rollback by restart recovery.
    RecoveryAborting,
    /// End record emitted; the transaction no longer exists.
    Complete,
}

impl TransactionStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Running, Committing)
                | (Running, Aborting)
                | (Running, RecoveryAborting)
                | (_, Complete)
        )
    }

    #[inline]
    pub fn is_terminal(self) -> bool {
        self == TransactionStatus::Complete
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Running => "RUNNING",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::Aborting => "ABORTING",
            TransactionStatus::RecoveryAborting => "RECOVERY_ABORTING",
            TransactionStatus::Complete => "COMPLETE",
        };
        write!(f, "{}", name)
    }
}

/// Multi-granularity lock modes.
///
/// # Compatibility Matrix
///
/// |     | NL | IS | IX | S | SIX | X |
/// |-----|----|----|----|---|-----|---|
/// | NL  | ✓  | ✓  | ✓  | ✓ | ✓   | ✓ |
/// | IS  | ✓  | ✓  | ✓  | ✓ | ✓   | ✗ |
/// | IX  | ✓  | ✓  | ✓  | ✗ | ✗   | ✗ |
/// | S   | ✓  | ✓  | ✗  | ✓ | ✗   | ✗ |
/// | SIX | ✓  | ✓  | ✗  | ✗ | ✗   | ✗ |
/// | X   | ✓  | ✗  | ✗  | ✗ | ✗   | ✗ |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// No lock held.
    NoLock,
    /// Intent to acquire shared locks on descendants.
    IntentShared,
    /// Intent to acquire exclusive locks on descendants.
    IntentExclusive,
    /// Shared access to the whole resource.
    Shared,
    /// Shared access plus intent to write descendants.
    SharedIntentExclusive,
    /// Exclusive access to the whole resource.
    Exclusive,
}

impl LockType {
    /// Whether locks of type `a` and `b` may be held on the same resource
    /// by two distinct transactions at the same time.
    pub fn compatible(a: LockType, b: LockType) -> bool {
        use LockType::*;
        match (a, b) {
            (NoLock, _) | (_, NoLock) => true,
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (IntentExclusive, IntentExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Whether holding `substitute` permits every operation that holding
    /// `required` permits.
    pub fn substitutable(substitute: LockType, required: LockType) -> bool {
        use LockType::*;
        if substitute == required {
            return true;
        }
        match required {
            NoLock => true,
            IntentShared => matches!(
                substitute,
                IntentExclusive | Shared | SharedIntentExclusive | Exclusive
            ),
            IntentExclusive => matches!(substitute, SharedIntentExclusive | Exclusive),
            Shared => matches!(substitute, SharedIntentExclusive | Exclusive),
            SharedIntentExclusive => substitute == Exclusive,
            Exclusive => false,
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockType::NoLock => "NL",
            LockType::IntentShared => "IS",
            LockType::IntentExclusive => "IX",
            LockType::Shared => "S",
            LockType::SharedIntentExclusive => "SIX",
            LockType::Exclusive => "X",
        };
        write!(f, "{}", name)
    }
}

/// Hierarchical name of a lockable resource, rooted at `database`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceName {
    parts: Vec<String>,
}

impl ResourceName {
    /// The root of the hierarchy.
    pub fn database() -> Self {
        Self {
            parts: vec!["database".to_string()],
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut parts = self.parts.clone();
        parts.push(segment.into());
        Self { parts }
    }

    pub fn parent(&self) -> Option<ResourceName> {
        if self.parts.len() <= 1 {
            return None;
        }
        Some(Self {
            parts: self.parts[..self.parts.len() - 1].to_vec(),
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("/"))
    }
}

/// A granted (or requested) lock on a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub resource: ResourceName,
    pub lock_type: LockType,
    pub txn_id: TransactionId,
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}: {}({})", self.txn_id, self.lock_type, self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use TransactionStatus::*;
        assert!(Running.can_transition_to(Committing));
        assert!(Running.can_transition_to(Aborting));
        assert!(Running.can_transition_to(RecoveryAborting));
        assert!(Committing.can_transition_to(Complete));
        assert!(Aborting.can_transition_to(Complete));
        assert!(RecoveryAborting.can_transition_to(Complete));

        assert!(!Committing.can_transition_to(Aborting));
        assert!(!Aborting.can_transition_to(Committing));
        assert!(!Complete.can_transition_to(Running));
        assert!(Complete.is_terminal());
    }

    #[test]
    fn test_compatibility_matrix() {
        use LockType::*;
        let all = [
            NoLock,
            IntentShared,
            IntentExclusive,
            Shared,
            SharedIntentExclusive,
            Exclusive,
        ];
        // Expected rows in the order of `all`, true = compatible.
        let expected = [
            [true, true, true, true, true, true],
            [true, true, true, true, true, false],
            [true, true, true, false, false, false],
            [true, true, false, true, false, false],
            [true, true, false, false, false, false],
            [true, false, false, false, false, false],
        ];
        for (i, &a) in all.iter().enumerate() {
            for (j, &b) in all.iter().enumerate() {
                assert_eq!(
                    LockType::compatible(a, b),
                    expected[i][j],
                    "compatible({}, {})",
                    a,
                    b
                );
                // The matrix is symmetric.
                assert_eq!(LockType::compatible(a, b), LockType::compatible(b, a));
            }
        }
    }

    #[test]
    fn test_substitutability() {
        use LockType::*;
        assert!(LockType::substitutable(Exclusive, Shared));
        assert!(LockType::substitutable(SharedIntentExclusive, IntentExclusive));
        assert!(LockType::substitutable(SharedIntentExclusive, Shared));
        assert!(LockType::substitutable(Shared, IntentShared));
        assert!(LockType::substitutable(Exclusive, NoLock));

        assert!(!LockType::substitutable(Shared, Exclusive));
        assert!(!LockType::substitutable(IntentExclusive, Shared));
        assert!(!LockType::substitutable(IntentShared, IntentExclusive));
    }

    #[test]
    fn test_resource_names() {
        let db = ResourceName::database();
        let table = db.child("orders");
        let page = table.child("page-3");

        assert_eq!(page.to_string(), "database/orders/page-3");
        assert_eq!(page.parent(), Some(table.clone()));
        assert_eq!(db.parent(), None);
        assert_ne!(table, db.child("customers"));
    }
}
