// Lock manager: per-resource granted lists with FIFO wait queues.
//
// One mutex covers every lookup-decide-mutate sequence. The actual park
// happens outside that critical section, after `prepare_block` ran inside
// it, so a release that races ahead of the park cannot be lost. All
// validation happens before any mutation: a failed operation leaves the
// manager exactly as it found it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::common::TransactionId;

use super::error::{TransactionError, TransactionResult};
use super::traits::TransactionContext;
use super::types::{Lock, LockType, ResourceName};

/// A queued lock request, optionally bundling locks to release when the
/// request is finally granted.
pub struct LockRequest {
    pub transaction: Arc<dyn TransactionContext>,
    pub lock: Lock,
    pub releasing: Vec<ResourceName>,
}

#[derive(Default)]
struct ResourceEntry {
    /// Granted locks in acquisition order.
    granted: Vec<Lock>,
    /// FIFO wait queue; only the head is ever considered for a grant.
    queue: VecDeque<LockRequest>,
}

#[derive(Default)]
struct LockState {
    resources: HashMap<ResourceName, ResourceEntry>,
    /// Per-transaction held locks, preserving acquisition order.
    txn_locks: HashMap<TransactionId, Vec<Lock>>,
}

impl LockState {
    fn held_type(&self, txn_id: TransactionId, name: &ResourceName) -> LockType {
        self.resources
            .get(name)
            .and_then(|entry| entry.granted.iter().find(|l| l.txn_id == txn_id))
            .map(|l| l.lock_type)
            .unwrap_or(LockType::NoLock)
    }

    /// Whether `lock_type` is compatible with every granted lock on the
    /// resource, ignoring locks held by `except`.
    fn compatible(
        &self,
        name: &ResourceName,
        except: Option<TransactionId>,
        lock_type: LockType,
    ) -> bool {
        let Some(entry) = self.resources.get(name) else {
            return true;
        };
        entry
            .granted
            .iter()
            .filter(|l| Some(l.txn_id) != except)
            .all(|l| LockType::compatible(l.lock_type, lock_type))
    }

    fn has_queue(&self, name: &ResourceName) -> bool {
        self.resources
            .get(name)
            .map_or(false, |entry| !entry.queue.is_empty())
    }

    fn enqueue_back(&mut self, request: LockRequest) {
        self.resources
            .entry(request.lock.resource.clone())
            .or_default()
            .queue
            .push_back(request);
    }

    fn enqueue_front(&mut self, request: LockRequest) {
        self.resources
            .entry(request.lock.resource.clone())
            .or_default()
            .queue
            .push_front(request);
    }

    /// Grants `lock`, or updates the type in place when the transaction
    /// already holds a lock on the resource. In-place updates keep the
    /// lock's position in both orderings, which is what makes promotion
    /// order-preserving.
    fn grant_or_update(&mut self, lock: Lock) {
        let entry = self.resources.entry(lock.resource.clone()).or_default();
        if let Some(existing) = entry.granted.iter_mut().find(|l| l.txn_id == lock.txn_id) {
            existing.lock_type = lock.lock_type;
        } else {
            entry.granted.push(lock.clone());
        }

        let txn_list = self.txn_locks.entry(lock.txn_id).or_default();
        if let Some(existing) = txn_list.iter_mut().find(|l| l.resource == lock.resource) {
            existing.lock_type = lock.lock_type;
        } else {
            txn_list.push(lock);
        }
    }

    fn remove_lock(&mut self, txn_id: TransactionId, name: &ResourceName) {
        let mut drop_resource = false;
        if let Some(entry) = self.resources.get_mut(name) {
            entry.granted.retain(|l| l.txn_id != txn_id);
            drop_resource = entry.granted.is_empty() && entry.queue.is_empty();
        }
        if drop_resource {
            self.resources.remove(name);
        }

        let mut drop_txn = false;
        if let Some(list) = self.txn_locks.get_mut(&txn_id) {
            list.retain(|l| l.resource != *name);
            drop_txn = list.is_empty();
        }
        if drop_txn {
            self.txn_locks.remove(&txn_id);
        }
    }

    fn release_and_wake(
        &mut self,
        txn_id: TransactionId,
        name: &ResourceName,
        woken: &mut Vec<Arc<dyn TransactionContext>>,
    ) {
        self.remove_lock(txn_id, name);
        self.process_queue(name, woken);
    }

    /// Grants queued requests from the front until the head is
    /// incompatible. Strict FIFO: an ungrantable head shields everything
    /// behind it, so later compatible requests cannot starve it.
    fn process_queue(
        &mut self,
        name: &ResourceName,
        woken: &mut Vec<Arc<dyn TransactionContext>>,
    ) {
        loop {
            let Some(front) = self.resources.get(name).and_then(|e| e.queue.front()) else {
                break;
            };
            let lock = front.lock.clone();
            let transaction = Arc::clone(&front.transaction);
            let releasing = front.releasing.clone();

            if !self.compatible(name, Some(lock.txn_id), lock.lock_type) {
                break;
            }

            if let Some(entry) = self.resources.get_mut(name) {
                entry.queue.pop_front();
            }
            debug!(%lock, "queued lock request granted");
            self.grant_or_update(lock.clone());
            for released in &releasing {
                if released != name {
                    self.release_and_wake(lock.txn_id, released, woken);
                }
            }
            woken.push(transaction);
        }
    }
}

/// The lock manager proper. See the module header for the locking
/// discipline; the public operations mirror the classic multigranularity
/// API: acquire, acquire-and-release, promote, release.
pub struct LockManager {
    state: Mutex<LockState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquires `lock_type` on `resource` for the transaction.
    ///
    /// Blocks (queued at the back) when the request is incompatible with
    /// the granted set or when any request is already queued; FIFO keeps
    /// latecomers from overtaking parked writers.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` when the transaction already holds any lock
    /// on the resource.
    pub fn acquire(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: ResourceName,
        lock_type: LockType,
    ) -> TransactionResult<()> {
        let txn_id = transaction.txn_id();
        let should_block = {
            let mut state = self.state.lock();
            let held = state.held_type(txn_id, &resource);
            if held != LockType::NoLock {
                return Err(TransactionError::duplicate_lock_request(
                    txn_id, &resource, held,
                ));
            }

            let block =
                !state.compatible(&resource, None, lock_type) || state.has_queue(&resource);
            let lock = Lock {
                resource,
                lock_type,
                txn_id,
            };
            if block {
                debug!(%lock, "lock request blocked; queued at back");
                state.enqueue_back(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    releasing: Vec::new(),
                });
                transaction.prepare_block();
            } else {
                state.grant_or_update(lock);
            }
            block
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Atomically acquires `lock_type` on `resource` and releases every
    /// resource in `release`. The new grant keeps the transaction's
    /// original acquisition position; a blocked request goes to the
    /// *front* of the queue since the transaction is giving locks up.
    ///
    /// # Errors
    ///
    /// `DuplicateLockRequest` when the resource is already held and not
    /// in `release`; `NoLockHeld` when any name in `release` is not held.
    pub fn acquire_and_release(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: ResourceName,
        lock_type: LockType,
        release: Vec<ResourceName>,
    ) -> TransactionResult<()> {
        let txn_id = transaction.txn_id();
        let woken = {
            let mut state = self.state.lock();
            let held = state.held_type(txn_id, &resource);
            if held != LockType::NoLock && !release.contains(&resource) {
                return Err(TransactionError::duplicate_lock_request(
                    txn_id, &resource, held,
                ));
            }
            for name in &release {
                if state.held_type(txn_id, name) == LockType::NoLock {
                    return Err(TransactionError::no_lock_held(txn_id, name));
                }
            }

            // The transaction's own locks don't count against it here:
            // replacing one's own lock is always self-compatible.
            let block = !state.compatible(&resource, Some(txn_id), lock_type);
            let lock = Lock {
                resource: resource.clone(),
                lock_type,
                txn_id,
            };
            if block {
                debug!(%lock, "acquire-and-release blocked; queued at front");
                state.enqueue_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    releasing: release,
                });
                transaction.prepare_block();
                None
            } else {
                state.grant_or_update(lock);
                let mut woken = Vec::new();
                for name in &release {
                    if *name != resource {
                        state.release_and_wake(txn_id, name, &mut woken);
                    }
                }
                Some(woken)
            }
        };
        match woken {
            None => transaction.block(),
            Some(woken) => {
                for waiter in woken {
                    waiter.unblock();
                }
            }
        }
        Ok(())
    }

    /// Promotes the transaction's lock on `resource` to `new_type`,
    /// in place: the lock keeps its position in the transaction's
    /// acquisition order. Blocks at the front of the queue when the
    /// promotion is incompatible with other holders.
    ///
    /// # Errors
    ///
    /// `NoLockHeld` without a prior lock; `InvalidLock` when `new_type`
    /// equals the held type or does not substitute for it.
    pub fn promote(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: ResourceName,
        new_type: LockType,
    ) -> TransactionResult<()> {
        let txn_id = transaction.txn_id();
        let should_block = {
            let mut state = self.state.lock();
            let held = state.held_type(txn_id, &resource);
            if held == LockType::NoLock {
                return Err(TransactionError::no_lock_held(txn_id, &resource));
            }
            if new_type == held || !LockType::substitutable(new_type, held) {
                return Err(TransactionError::invalid_lock(
                    txn_id, &resource, held, new_type,
                ));
            }

            let block = !state.compatible(&resource, Some(txn_id), new_type);
            let lock = Lock {
                resource,
                lock_type: new_type,
                txn_id,
            };
            if block {
                debug!(%lock, "promotion blocked; queued at front");
                state.enqueue_front(LockRequest {
                    transaction: Arc::clone(transaction),
                    lock,
                    releasing: Vec::new(),
                });
                transaction.prepare_block();
            } else {
                state.grant_or_update(lock);
            }
            block
        };
        if should_block {
            transaction.block();
        }
        Ok(())
    }

    /// Releases the transaction's lock on `resource` and re-evaluates the
    /// resource's wait queue.
    ///
    /// # Errors
    ///
    /// `NoLockHeld` when no lock is held on the resource.
    pub fn release(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        resource: &ResourceName,
    ) -> TransactionResult<()> {
        let txn_id = transaction.txn_id();
        let woken = {
            let mut state = self.state.lock();
            if state.held_type(txn_id, resource) == LockType::NoLock {
                return Err(TransactionError::no_lock_held(txn_id, resource));
            }
            let mut woken = Vec::new();
            state.release_and_wake(txn_id, resource, &mut woken);
            woken
        };
        for waiter in woken {
            waiter.unblock();
        }
        Ok(())
    }

    /// The lock type the transaction holds on `resource` (`NoLock` if
    /// none).
    pub fn get_lock_type(&self, txn_id: TransactionId, resource: &ResourceName) -> LockType {
        self.state.lock().held_type(txn_id, resource)
    }

    /// Snapshot of the granted locks on a resource, in grant order.
    pub fn get_resource_locks(&self, resource: &ResourceName) -> Vec<Lock> {
        self.state
            .lock()
            .resources
            .get(resource)
            .map(|entry| entry.granted.clone())
            .unwrap_or_default()
    }

    /// Snapshot of a transaction's locks in acquisition order.
    pub fn get_transaction_locks(&self, txn_id: TransactionId) -> Vec<Lock> {
        self.state
            .lock()
            .txn_locks
            .get(&txn_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A position in the resource hierarchy bound to a lock manager. Contexts
/// are cheap to create and only name resources; all state lives in the
/// manager.
#[derive(Clone)]
pub struct LockContext {
    manager: Arc<LockManager>,
    name: ResourceName,
}

impl LockContext {
    /// Context for the root of the hierarchy.
    pub fn database(manager: Arc<LockManager>) -> Self {
        Self {
            manager,
            name: ResourceName::database(),
        }
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            name: self.name.child(segment),
        }
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn acquire(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        lock_type: LockType,
    ) -> TransactionResult<()> {
        self.manager.acquire(transaction, self.name.clone(), lock_type)
    }

    pub fn promote(
        &self,
        transaction: &Arc<dyn TransactionContext>,
        new_type: LockType,
    ) -> TransactionResult<()> {
        self.manager.promote(transaction, self.name.clone(), new_type)
    }

    pub fn release(&self, transaction: &Arc<dyn TransactionContext>) -> TransactionResult<()> {
        self.manager.release(transaction, &self.name)
    }

    pub fn held_by(&self, txn_id: TransactionId) -> LockType {
        self.manager.get_lock_type(txn_id, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::types::TransactionStatus;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transaction context whose `block` does not park, so queueing
    /// behavior can be driven from a single thread.
    struct TestTxn {
        id: TransactionId,
        blocked: AtomicBool,
    }

    impl TestTxn {
        fn new(id: TransactionId) -> Arc<dyn TransactionContext> {
            Arc::new(Self {
                id,
                blocked: AtomicBool::new(false),
            })
        }
    }

    impl TransactionContext for TestTxn {
        fn txn_id(&self) -> TransactionId {
            self.id
        }
        fn status(&self) -> TransactionStatus {
            TransactionStatus::Running
        }
        fn set_status(&self, _status: TransactionStatus) {}
        fn cleanup(&self) {}
        fn prepare_block(&self) {
            self.blocked.store(true, Ordering::SeqCst);
        }
        fn block(&self) {}
        fn unblock(&self) {
            self.blocked.store(false, Ordering::SeqCst);
        }
        fn is_blocked(&self) -> bool {
            self.blocked.load(Ordering::SeqCst)
        }
    }

    fn table_a() -> ResourceName {
        ResourceName::database().child("A")
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let t2 = TestTxn::new(2);

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        lm.acquire(&t2, table_a(), LockType::Shared).unwrap();
        assert!(!t1.is_blocked());
        assert!(!t2.is_blocked());
        assert_eq!(lm.get_resource_locks(&table_a()).len(), 2);
    }

    #[test]
    fn test_duplicate_acquire_rejected() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        let err = lm.acquire(&t1, table_a(), LockType::Exclusive).unwrap_err();
        assert!(matches!(err, TransactionError::DuplicateLockRequest { .. }));
        // Failed operations leave the state untouched.
        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Shared);
    }

    #[test]
    fn test_fifo_blocking_and_grant() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let t2 = TestTxn::new(2);
        let t3 = TestTxn::new(3);

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        lm.acquire(&t2, table_a(), LockType::Exclusive).unwrap();
        assert!(t2.is_blocked());
        // Compatible with T1's lock, but the queue is non-empty: FIFO says
        // T3 waits behind T2.
        lm.acquire(&t3, table_a(), LockType::Shared).unwrap();
        assert!(t3.is_blocked());

        lm.release(&t1, &table_a()).unwrap();
        assert!(!t2.is_blocked());
        assert_eq!(lm.get_lock_type(2, &table_a()), LockType::Exclusive);
        assert!(t3.is_blocked());

        lm.release(&t2, &table_a()).unwrap();
        assert!(!t3.is_blocked());
        assert_eq!(lm.get_lock_type(3, &table_a()), LockType::Shared);
    }

    #[test]
    fn test_release_requires_hold() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let err = lm.release(&t1, &table_a()).unwrap_err();
        assert!(matches!(err, TransactionError::NoLockHeld { .. }));
    }

    #[test]
    fn test_promote_validations() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);

        let err = lm.promote(&t1, table_a(), LockType::Exclusive).unwrap_err();
        assert!(matches!(err, TransactionError::NoLockHeld { .. }));

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        let err = lm.promote(&t1, table_a(), LockType::Shared).unwrap_err();
        assert!(matches!(err, TransactionError::InvalidLock { .. }));
        let err = lm
            .promote(&t1, table_a(), LockType::IntentExclusive)
            .unwrap_err();
        assert!(matches!(err, TransactionError::InvalidLock { .. }));

        lm.promote(&t1, table_a(), LockType::Exclusive).unwrap();
        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Exclusive);
    }

    #[test]
    fn test_promotion_preserves_acquisition_order() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let db = ResourceName::database();
        let b = db.child("B");

        lm.acquire(&t1, db.clone(), LockType::IntentExclusive).unwrap();
        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        lm.acquire(&t1, b.clone(), LockType::Shared).unwrap();

        lm.promote(&t1, table_a(), LockType::Exclusive).unwrap();

        let order: Vec<ResourceName> = lm
            .get_transaction_locks(1)
            .into_iter()
            .map(|l| l.resource)
            .collect();
        assert_eq!(order, vec![db, table_a(), b]);
        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Exclusive);
    }

    #[test]
    fn test_acquire_and_release_atomic_swap() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let b = ResourceName::database().child("B");

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        lm.acquire(&t1, b.clone(), LockType::Exclusive).unwrap();

        lm.acquire_and_release(&t1, table_a(), LockType::Exclusive, vec![table_a()])
            .unwrap();

        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Exclusive);
        assert_eq!(lm.get_lock_type(1, &b), LockType::Exclusive);
        let order: Vec<ResourceName> = lm
            .get_transaction_locks(1)
            .into_iter()
            .map(|l| l.resource)
            .collect();
        assert_eq!(order, vec![table_a(), b]);
    }

    #[test]
    fn test_acquire_and_release_validates_before_mutating() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let b = ResourceName::database().child("B");

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        let err = lm
            .acquire_and_release(&t1, table_a(), LockType::Exclusive, vec![b.clone()])
            .unwrap_err();
        assert!(matches!(err, TransactionError::NoLockHeld { .. }));
        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Shared);
    }

    #[test]
    fn test_blocked_promotion_goes_to_front() {
        let lm = LockManager::new();
        let t1 = TestTxn::new(1);
        let t2 = TestTxn::new(2);
        let t3 = TestTxn::new(3);

        lm.acquire(&t1, table_a(), LockType::Shared).unwrap();
        lm.acquire(&t2, table_a(), LockType::Shared).unwrap();
        // T3 queues for X behind the two holders.
        lm.acquire(&t3, table_a(), LockType::Exclusive).unwrap();
        assert!(t3.is_blocked());
        // T1's promotion conflicts with T2's S lock and must wait, but at
        // the front of the queue.
        lm.promote(&t1, table_a(), LockType::Exclusive).unwrap();
        assert!(t1.is_blocked());

        lm.release(&t2, &table_a()).unwrap();
        assert!(!t1.is_blocked());
        assert_eq!(lm.get_lock_type(1, &table_a()), LockType::Exclusive);
        assert!(t3.is_blocked());
    }

    #[test]
    fn test_lock_context_hierarchy() {
        let lm = Arc::new(LockManager::new());
        let t1 = TestTxn::new(1);
        let db = LockContext::database(Arc::clone(&lm));
        let table = db.child("orders");

        db.acquire(&t1, LockType::IntentShared).unwrap();
        table.acquire(&t1, LockType::Shared).unwrap();
        assert_eq!(db.held_by(1), LockType::IntentShared);
        assert_eq!(table.held_by(1), LockType::Shared);
        assert_eq!(table.name().to_string(), "database/orders");

        table.release(&t1).unwrap();
        assert_eq!(table.held_by(1), LockType::NoLock);
    }
}
