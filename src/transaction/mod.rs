// Transactional correctness core.
//
// Two loosely coupled subsystems share only transaction identity and
// status:
//
// | Module | Responsibility |
// |--------|----------------|
// | [`wal`] | Append-only log addressed by LSN |
// | [`records`] | Log record model: redo, undo, CLRs |
// | [`recovery`] | Forward-path logging and three-phase restart |
// | [`lock_manager`] | Per-resource lock lists and FIFO wait queues |
// | [`types`] | Statuses, lock modes, resource names |
// | [`traits`] | Transaction handle seam |
// | [`handle`] | Default blocking transaction handle |
// | [`error`] | Transaction-specific errors |

pub mod error;
pub mod handle;
pub mod lock_manager;
pub mod records;
pub mod recovery;
pub mod traits;
pub mod types;
pub mod wal;

pub use error::{TransactionError, TransactionResult};
pub use handle::TxnHandle;
pub use lock_manager::{LockContext, LockManager, LockRequest};
pub use records::LogRecord;
pub use recovery::RecoveryManager;
pub use traits::{TransactionContext, TransactionFactory};
pub use types::{Lock, LockType, ResourceName, TransactionStatus};
pub use wal::{LogManager, LogScan};
