// Seams between the correctness core and the transaction objects owned by
// the execution layer.

use std::sync::Arc;

use crate::common::TransactionId;

use super::types::TransactionStatus;

/// The slice of a transaction the recovery and lock managers need.
///
/// The managers never own transactions; they hold these handles. Blocking
/// is split into `prepare_block` (called inside the lock manager's critical
/// section) and `block` (called outside it) so that an unblock racing ahead
/// of the park is observed rather than lost.
pub trait TransactionContext: Send + Sync {
    fn txn_id(&self) -> TransactionId;

    fn status(&self) -> TransactionStatus;

    /// Moves the transaction to `status`. Implementations must reject
    /// illegal transitions; attempting one is a programming error.
    fn set_status(&self, status: TransactionStatus);

    /// Releases transaction-owned resources. Invoked when recovery retires
    /// the transaction (end-record emission and restart cleanup).
    fn cleanup(&self);

    /// Marks the transaction as about to park.
    fn prepare_block(&self);

    /// Parks until `unblock`, or returns immediately if `unblock` already
    /// ran since `prepare_block`.
    fn block(&self);

    fn unblock(&self);

    /// True between `prepare_block` and the matching `unblock`.
    fn is_blocked(&self) -> bool;
}

/// Factory injected into the recovery manager so restart analysis can
/// materialize handles for transactions it discovers in the log.
pub type TransactionFactory = Box<dyn Fn(TransactionId) -> Arc<dyn TransactionContext> + Send + Sync>;
