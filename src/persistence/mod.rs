//! Persistence layer for state recovery
//!
//! - Checkpoint store with checksum-verified restore
//! - Retry with exponential backoff
//! - Append-only audit log

pub mod audit;
pub mod checkpoint;
pub mod recovery;
pub mod retry;

pub use audit::{AuditEntry, AuditLog};
pub use checkpoint::{Checkpoint, CheckpointStore, Transactional};
pub use recovery::{with_transaction_rollback, RecoverySystem};
pub use retry::{retry_with_backoff, RetryFailure, RetryPolicy};
