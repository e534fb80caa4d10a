use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::common::TransactionId;

use super::traits::{TransactionContext, TransactionFactory};
use super::types::TransactionStatus;

struct HandleState {
    status: TransactionStatus,
    block_pending: bool,
}

/// Default transaction handle: a status cell plus a condvar park/unpark
/// pair for the lock manager.
pub struct TxnHandle {
    id: TransactionId,
    state: Mutex<HandleState>,
    unparked: Condvar,
}

impl TxnHandle {
    pub fn new(id: TransactionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(HandleState {
                status: TransactionStatus::Running,
                block_pending: false,
            }),
            unparked: Condvar::new(),
        })
    }

    /// Factory for injection into the recovery manager.
    pub fn factory() -> TransactionFactory {
        Box::new(|id| TxnHandle::new(id) as Arc<dyn TransactionContext>)
    }
}

impl TransactionContext for TxnHandle {
    fn txn_id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn set_status(&self, status: TransactionStatus) {
        let mut state = self.state.lock();
        assert!(
            state.status.can_transition_to(status),
            "illegal status transition {} -> {} for transaction {}",
            state.status,
            status,
            self.id
        );
        state.status = status;
    }

    fn cleanup(&self) {}

    fn prepare_block(&self) {
        self.state.lock().block_pending = true;
    }

    fn block(&self) {
        let mut state = self.state.lock();
        while state.block_pending {
            self.unparked.wait(&mut state);
        }
    }

    fn unblock(&self) {
        let mut state = self.state.lock();
        state.block_pending = false;
        drop(state);
        self.unparked.notify_all();
    }

    fn is_blocked(&self) -> bool {
        self.state.lock().block_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_round_trip() {
        let txn = TxnHandle::new(1);
        assert_eq!(txn.status(), TransactionStatus::Running);
        txn.set_status(TransactionStatus::Committing);
        txn.set_status(TransactionStatus::Complete);
        assert_eq!(txn.status(), TransactionStatus::Complete);
    }

    #[test]
    #[should_panic(expected = "illegal status transition")]
    fn test_illegal_transition_panics() {
        let txn = TxnHandle::new(1);
        txn.set_status(TransactionStatus::Committing);
        txn.set_status(TransactionStatus::Aborting);
    }

    #[test]
    fn test_unblock_before_block_does_not_park() {
        let txn = TxnHandle::new(1);
        txn.prepare_block();
        assert!(txn.is_blocked());
        txn.unblock();
        // Must return immediately instead of parking forever.
        txn.block();
        assert!(!txn.is_blocked());
    }

    #[test]
    fn test_block_parks_until_unblocked() {
        let txn = TxnHandle::new(1);
        txn.prepare_block();

        let parked = Arc::clone(&txn);
        let handle = std::thread::spawn(move || {
            parked.block();
        });

        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        txn.unblock();
        handle.join().unwrap();
        assert!(!txn.is_blocked());
    }
}
