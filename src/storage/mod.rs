pub mod checkpoint;
pub mod lock;

pub use checkpoint::{CheckpointInfo, CheckpointStore};
pub use lock::{AcquireOutcome, LockGuard, LockRecord, ProcessLock, local_hostname};
