//! Recovery system
//!
//! Owns the checkpoint store and the retry policy used for transient worker
//! failures. Restore is a pure read; it never mutates stored checkpoints.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{error, info, warn};

use super::checkpoint::{transaction_scope, Checkpoint, CheckpointStore, Transactional};
use super::retry::{retry_with_backoff, RetryFailure, RetryPolicy};
use crate::config::RecoveryConfig;
use crate::error::{Result, WardenError};

pub struct RecoverySystem {
    store: CheckpointStore,
    policy: RetryPolicy,
}

impl RecoverySystem {
    pub fn new(config: &RecoveryConfig) -> Self {
        Self {
            store: CheckpointStore::new(&config.checkpoint_dir, config.max_checkpoints),
            policy: RetryPolicy::from_config(config),
        }
    }

    pub fn with_store(store: CheckpointStore, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Append a checkpoint for `state_type`
    pub async fn create_checkpoint(
        &self,
        state_type: &str,
        data: serde_json::Value,
        metadata: BTreeMap<String, String>,
    ) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(state_type, data, metadata)?;
        match self.store.append(&checkpoint).await {
            Ok(()) => {
                info!("Created checkpoint {} for {}", checkpoint.id, state_type);
                Ok(checkpoint)
            }
            Err(e) => {
                error!("Failed to checkpoint {}: {}", state_type, e);
                Err(e)
            }
        }
    }

    /// Latest checkpoint that passes checksum verification
    pub async fn restore_checkpoint(&self, state_type: &str) -> Result<Option<Checkpoint>> {
        let restored = self.store.latest_valid(state_type).await?;
        match &restored {
            Some(cp) => info!(
                "Restored checkpoint {} for {} (taken {})",
                cp.id, state_type, cp.timestamp
            ),
            None => warn!("No valid checkpoint for {}", state_type),
        }
        Ok(restored)
    }

    pub async fn create_typed<T: Serialize>(
        &self,
        state_type: &str,
        state: &T,
        metadata: BTreeMap<String, String>,
    ) -> Result<Checkpoint> {
        let data = serde_json::to_value(state)?;
        self.create_checkpoint(state_type, data, metadata).await
    }

    pub async fn restore_typed<T: DeserializeOwned>(&self, state_type: &str) -> Result<Option<T>> {
        match self.restore_checkpoint(state_type).await? {
            Some(cp) => Ok(Some(serde_json::from_value(cp.payload)?)),
            None => Ok(None),
        }
    }

    /// Retry `op` under the configured policy, retrying only transient errors
    pub async fn retry_with_backoff<T, F, Fut>(
        &self,
        op: F,
    ) -> std::result::Result<T, RetryFailure<WardenError>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_backoff(&self.policy, WardenError::is_transient, op).await
    }

    /// Run `op` against the checkpoint store, rolling back its writes on error
    pub async fn checkpoint_transaction<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_transaction_rollback(&self.store, op).await
    }
}

/// Savepoint `handle`, run `op`, roll back on error.
///
/// `op` runs in its own transaction scope, so only writes it makes are
/// rolled back. The original error is returned even when the rollback itself
/// fails.
pub async fn with_transaction_rollback<H, T, F, Fut>(handle: &H, op: F) -> Result<T>
where
    H: Transactional,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    transaction_scope(async move {
        let savepoint = handle.savepoint().await?;
        match op().await {
            Ok(value) => {
                if let Err(e) = handle.commit(savepoint).await {
                    warn!("Post-commit cleanup failed: {}", e);
                }
                Ok(value)
            }
            Err(e) => {
                warn!("Operation failed, rolling back: {}", e);
                if let Err(rollback_err) = handle.rollback(savepoint).await {
                    error!("Rollback failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Book {
        positions: Vec<String>,
        cash: u64,
    }

    fn system(dir: &std::path::Path) -> RecoverySystem {
        RecoverySystem::with_store(
            CheckpointStore::new(dir, 5),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
            },
        )
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = system(dir.path());
        let book = Book {
            positions: vec!["BTC-UP".into()],
            cash: 1_250,
        };

        recovery.create_typed("worker.trader", &book, BTreeMap::new()).await.unwrap();
        let restored: Book = recovery.restore_typed("worker.trader").await.unwrap().unwrap();
        assert_eq!(restored, book);
    }

    #[tokio::test]
    async fn test_restore_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = system(dir.path());
        assert!(recovery.restore_checkpoint("system").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transaction_rollback_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = system(dir.path());
        recovery
            .create_checkpoint("system", json!({"v": 1}), BTreeMap::new())
            .await
            .unwrap();

        let r = &recovery;
        let result: Result<()> = recovery
            .checkpoint_transaction(|| async move {
                r.create_checkpoint("system", json!({"v": 2}), BTreeMap::new())
                    .await?;
                Err(WardenError::Internal("apply failed".into()))
            })
            .await;

        assert!(matches!(result, Err(WardenError::Internal(_))));
        let latest = recovery.restore_checkpoint("system").await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_failed_transaction_restores_pruned_history() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = RecoverySystem::with_store(
            CheckpointStore::new(dir.path(), 2),
            RetryPolicy::default(),
        );
        recovery
            .create_checkpoint("system", json!({"v": 1}), BTreeMap::new())
            .await
            .unwrap();

        let r = &recovery;
        let result: Result<()> = recovery
            .checkpoint_transaction(|| async move {
                for v in [2, 3] {
                    r.create_checkpoint("system", json!({ "v": v }), BTreeMap::new())
                        .await?;
                }
                Err(WardenError::Internal("apply failed".into()))
            })
            .await;

        assert!(result.is_err());
        let latest = recovery.restore_checkpoint("system").await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn test_transaction_success_keeps_writes() {
        let dir = tempfile::tempdir().unwrap();
        let recovery = system(dir.path());

        let r = &recovery;
        let id = recovery
            .checkpoint_transaction(|| async move {
                let cp = r
                    .create_checkpoint("system", json!({"v": 3}), BTreeMap::new())
                    .await?;
                Ok(cp.id)
            })
            .await
            .unwrap();

        let latest = recovery.restore_checkpoint("system").await.unwrap().unwrap();
        assert_eq!(latest.id, id);
    }
}
