//! Transaction-specific error types.
//!
//! Lock-manager failures are ordinary values: every check runs before any
//! state is mutated, so an `Err` always leaves the manager untouched.
//! Violated internal invariants (unknown transactions, broken record
//! chains) are not represented here; those panic.

use thiserror::Error;

use crate::common::TransactionId;

use super::types::{LockType, ResourceName};

/// Result type alias for transaction operations.
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

#[derive(Debug, Error)]
pub enum TransactionError {
    /// Acquire on a resource the transaction already holds a lock on.
    #[error(
        "duplicate lock request: transaction {txn_id} already holds {held} on '{resource}'"
    )]
    DuplicateLockRequest {
        txn_id: TransactionId,
        resource: String,
        held: LockType,
    },

    /// Release or promote without a prior lock, or an acquire-and-release
    /// listing an unheld resource.
    #[error("no lock held: transaction {txn_id} holds no lock on '{resource}'")]
    NoLockHeld {
        txn_id: TransactionId,
        resource: String,
    },

    /// Promotion to an identical or non-substitutable type.
    #[error(
        "invalid lock promotion: transaction {txn_id} cannot go from {from} to {to} on '{resource}'"
    )]
    InvalidLock {
        txn_id: TransactionId,
        resource: String,
        from: LockType,
        to: LockType,
    },

    /// Rollback target that was never recorded (or already released).
    #[error("savepoint '{name}' not found in transaction {txn_id}")]
    SavepointNotFound {
        txn_id: TransactionId,
        name: String,
    },
}

impl TransactionError {
    pub fn duplicate_lock_request(
        txn_id: TransactionId,
        resource: &ResourceName,
        held: LockType,
    ) -> Self {
        TransactionError::DuplicateLockRequest {
            txn_id,
            resource: resource.to_string(),
            held,
        }
    }

    pub fn no_lock_held(txn_id: TransactionId, resource: &ResourceName) -> Self {
        TransactionError::NoLockHeld {
            txn_id,
            resource: resource.to_string(),
        }
    }

    pub fn invalid_lock(
        txn_id: TransactionId,
        resource: &ResourceName,
        from: LockType,
        to: LockType,
    ) -> Self {
        TransactionError::InvalidLock {
            txn_id,
            resource: resource.to_string(),
            from,
            to,
        }
    }

    pub fn savepoint_not_found(txn_id: TransactionId, name: impl Into<String>) -> Self {
        TransactionError::SavepointNotFound {
            txn_id,
            name: name.into(),
        }
    }

    /// True for errors raised by the lock manager.
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            TransactionError::DuplicateLockRequest { .. }
                | TransactionError::NoLockHeld { .. }
                | TransactionError::InvalidLock { .. }
        )
    }

    /// The transaction this error is about.
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionError::DuplicateLockRequest { txn_id, .. }
            | TransactionError::NoLockHeld { txn_id, .. }
            | TransactionError::InvalidLock { txn_id, .. }
            | TransactionError::SavepointNotFound { txn_id, .. } => *txn_id,
        }
    }
}
