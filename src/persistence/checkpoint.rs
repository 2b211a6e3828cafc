//! File-backed checkpoint store
//!
//! Layout: `<root>/<state_type>/<seq>_<id>.json`. The zero-padded sequence
//! prefix keeps lexical order equal to write order, so the newest checkpoint
//! sorts last. Writes go to a `.tmp` file that is renamed into place.
//!
//! Writes made inside a [`transaction_scope`] are journaled against that
//! transaction: they are not pruned until commit, and a rollback deletes
//! exactly those files. Writes from other tasks are never touched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WardenError};

/// Checkpoint data structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: Uuid,
    pub state_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Hex sha256 of the serialized payload
    pub checksum: String,
}

impl Checkpoint {
    pub fn new(
        state_type: &str,
        payload: serde_json::Value,
        metadata: BTreeMap<String, String>,
    ) -> Result<Self> {
        let checksum = payload_checksum(&payload)?;
        Ok(Self {
            id: Uuid::new_v4(),
            state_type: state_type.to_string(),
            timestamp: Utc::now(),
            payload,
            metadata,
            checksum,
        })
    }

    pub fn verify(&self) -> bool {
        payload_checksum(&self.payload)
            .map(|sum| sum == self.checksum)
            .unwrap_or(false)
    }
}

fn payload_checksum(payload: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Unit of work that can be rolled back to an earlier savepoint
#[async_trait]
pub trait Transactional: Send + Sync {
    type Savepoint: Send;

    async fn savepoint(&self) -> Result<Self::Savepoint>;

    /// Make the work since `savepoint` permanent
    async fn commit(&self, _savepoint: Self::Savepoint) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, savepoint: Self::Savepoint) -> Result<()>;
}

tokio::task_local! {
    static TRANSACTION: TransactionScope;
}

#[derive(Debug, Clone, Copy)]
struct TransactionScope {
    id: u64,
    parent: Option<u64>,
}

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

fn current_scope() -> Option<TransactionScope> {
    TRANSACTION.try_with(|scope| *scope).ok()
}

/// Run `fut` as a new transaction, nested in the caller's one if any.
/// Work spawned onto other tasks is outside the scope.
pub async fn transaction_scope<F: Future>(fut: F) -> F::Output {
    let scope = TransactionScope {
        id: NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed),
        parent: current_scope().map(|s| s.id),
    };
    TRANSACTION.scope(scope, fut).await
}

#[derive(Debug, Default)]
struct Journal {
    parent: Option<u64>,
    written: Vec<PathBuf>,
}

#[derive(Default)]
struct StoreState {
    /// Last sequence handed out
    seq: u64,
    /// Open transactions by scope id
    journals: HashMap<u64, Journal>,
}

impl StoreState {
    /// Journal the calling task writes into, if it is inside an open transaction
    fn journal_for_current(&mut self) -> Option<&mut Journal> {
        let scope = current_scope()?;
        let id = if self.journals.contains_key(&scope.id) {
            scope.id
        } else {
            scope.parent.filter(|p| self.journals.contains_key(p))?
        };
        self.journals.get_mut(&id)
    }

    fn pending(&self) -> HashSet<&Path> {
        self.journals
            .values()
            .flat_map(|j| j.written.iter().map(PathBuf::as_path))
            .collect()
    }
}

pub struct CheckpointStore {
    root: PathBuf,
    max_checkpoints: usize,
    /// Serializes writers
    state: Mutex<StoreState>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            root: root.into(),
            max_checkpoints: max_checkpoints.max(1),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append a checkpoint and prune the oldest beyond the retention limit.
    /// Inside a transaction pruning waits for commit.
    pub async fn append(&self, checkpoint: &Checkpoint) -> Result<()> {
        validate_state_type(&checkpoint.state_type)?;
        let dir = self.root.join(&checkpoint.state_type);

        let mut state = self.state.lock().await;
        let next = (state.seq + 1).max(micros_now());

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("create checkpoint dir", &dir, e))?;

        let name = format!("{:020}_{}.json", next, checkpoint.id);
        let final_path = dir.join(&name);
        let tmp_path = dir.join(format!("{}.tmp", name));

        let body = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| storage_err("write checkpoint", &tmp_path, e))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(storage_err("commit checkpoint", &final_path, e));
        }
        state.seq = next;

        debug!(
            "Checkpoint {} written for {} ({} bytes)",
            checkpoint.id,
            checkpoint.state_type,
            body.len()
        );

        if let Some(journal) = state.journal_for_current() {
            journal.written.push(final_path);
            return Ok(());
        }
        self.prune(&dir, &state.pending()).await
    }

    /// Latest checkpoint whose checksum verifies
    pub async fn latest_valid(&self, state_type: &str) -> Result<Option<Checkpoint>> {
        validate_state_type(state_type)?;
        let dir = self.root.join(state_type);
        let mut files = list_checkpoint_files(&dir).await?;
        files.reverse();

        for (_, path) in files {
            match read_checkpoint(&path).await {
                Ok(cp) if cp.verify() => return Ok(Some(cp)),
                Ok(cp) => warn!(
                    "Checkpoint {} for {} failed checksum verification, skipping",
                    cp.id, state_type
                ),
                Err(e) => warn!("Unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }

    /// All stored checkpoints for a state type, oldest first
    pub async fn list(&self, state_type: &str) -> Result<Vec<Checkpoint>> {
        validate_state_type(state_type)?;
        let dir = self.root.join(state_type);
        let mut out = Vec::new();
        for (_, path) in list_checkpoint_files(&dir).await? {
            if let Ok(cp) = read_checkpoint(&path).await {
                out.push(cp);
            }
        }
        Ok(out)
    }

    /// State types with at least one directory on disk
    pub async fn state_types(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err("list checkpoint root", &self.root, e)),
        };
        let mut types = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("list checkpoint root", &self.root, e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                if let Some(name) = entry.file_name().to_str() {
                    types.push(name.to_string());
                }
            }
        }
        types.sort();
        Ok(types)
    }

    /// Drop the oldest committed checkpoints beyond the limit. Files written by
    /// open transactions neither count nor get removed.
    async fn prune(&self, dir: &Path, pending: &HashSet<&Path>) -> Result<()> {
        let files: Vec<_> = list_checkpoint_files(dir)
            .await?
            .into_iter()
            .filter(|(_, path)| !pending.contains(path.as_path()))
            .collect();
        if files.len() <= self.max_checkpoints {
            return Ok(());
        }
        let excess = files.len() - self.max_checkpoints;
        for (_, path) in files.into_iter().take(excess) {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| storage_err("prune checkpoint", &path, e))?;
        }
        debug!("Pruned {} checkpoint(s) in {}", excess, dir.display());
        Ok(())
    }
}

#[async_trait]
impl Transactional for CheckpointStore {
    /// Scope id of the transaction
    type Savepoint = u64;

    async fn savepoint(&self) -> Result<u64> {
        let scope = current_scope().ok_or_else(|| {
            WardenError::Validation("checkpoint savepoint taken outside a transaction scope".into())
        })?;
        let mut state = self.state.lock().await;
        state.journals.insert(
            scope.id,
            Journal {
                parent: scope.parent,
                written: Vec::new(),
            },
        );
        Ok(scope.id)
    }

    async fn commit(&self, savepoint: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(journal) = state.journals.remove(&savepoint) else {
            return Ok(());
        };

        // A nested commit hands its writes to the enclosing transaction
        if let Some(parent) = journal.parent.and_then(|p| state.journals.get_mut(&p)) {
            parent.written.extend(journal.written);
            return Ok(());
        }

        let dirs: BTreeSet<PathBuf> = journal
            .written
            .iter()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        let pending = state.pending();
        for dir in dirs {
            self.prune(&dir, &pending).await?;
        }
        Ok(())
    }

    async fn rollback(&self, savepoint: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(journal) = state.journals.remove(&savepoint) else {
            return Ok(());
        };
        let mut removed = 0usize;
        for path in &journal.written {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(storage_err("roll back checkpoint", path, e)),
            }
        }
        if removed > 0 {
            info!("Rolled back {} checkpoint(s) written by the transaction", removed);
        }
        Ok(())
    }
}

fn micros_now() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

fn storage_err(action: &str, path: &Path, e: std::io::Error) -> WardenError {
    WardenError::Storage(format!("{} {}: {}", action, path.display(), e))
}

/// State types double as directory names
fn validate_state_type(state_type: &str) -> Result<()> {
    let valid = !state_type.is_empty()
        && !state_type.starts_with('.')
        && state_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WardenError::Validation(format!(
            "invalid checkpoint state type: {:?}",
            state_type
        )))
    }
}

/// Committed checkpoint files with their sequence numbers, oldest first
async fn list_checkpoint_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(storage_err("list checkpoints", dir, e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| storage_err("list checkpoints", dir, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".json") {
            continue;
        }
        let Some(seq) = name.split('_').next().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        files.push((seq, entry.path()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(files)
}

async fn read_checkpoint(path: &Path) -> Result<Checkpoint> {
    let body = tokio::fs::read(path)
        .await
        .map_err(|e| storage_err("read checkpoint", path, e))?;
    Ok(serde_json::from_slice(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cp(state_type: &str, payload: serde_json::Value) -> Checkpoint {
        Checkpoint::new(state_type, payload, BTreeMap::new()).unwrap()
    }

    #[tokio::test]
    async fn test_latest_checkpoint_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);

        store.append(&cp("system", json!({"n": 1}))).await.unwrap();
        store.append(&cp("system", json!({"n": 2}))).await.unwrap();

        let latest = store.latest_valid("system").await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"n": 2}));
        assert!(store.latest_valid("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prunes_oldest_beyond_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 3);

        for n in 0..5 {
            store.append(&cp("worker.feed", json!({ "n": n }))).await.unwrap();
        }

        let all = store.list("worker.feed").await.unwrap();
        let ns: Vec<_> = all.iter().map(|c| c.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);

        store.append(&cp("system", json!({"good": true}))).await.unwrap();
        let mut tampered = cp("system", json!({"good": false}));
        tampered.payload = json!({"good": "tampered"});
        store.append(&tampered).await.unwrap();

        let latest = store.latest_valid("system").await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"good": true}));
    }

    async fn write(store: &CheckpointStore, state_type: &str, payload: serde_json::Value) {
        store.append(&cp(state_type, payload)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_removes_only_transaction_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);
        write(&store, "system", json!({"keep": 1})).await;

        let (tx_ready, rx_ready) = tokio::sync::oneshot::channel();
        let (tx_done, rx_done) = tokio::sync::oneshot::channel::<()>();
        let store = std::sync::Arc::new(store);

        let txn_store = store.clone();
        let txn = tokio::spawn(transaction_scope(async move {
            let sp = txn_store.savepoint().await.unwrap();
            write(&txn_store, "system", json!({"drop": 1})).await;
            write(&txn_store, "worker.a", json!({"drop": 2})).await;
            tx_ready.send(()).unwrap();
            rx_done.await.unwrap();
            txn_store.rollback(sp).await.unwrap();
        }));

        rx_ready.await.unwrap();
        // Another task persisting while the transaction is open
        write(&store, "kill_switch", json!({"phase": "ACTIVE"})).await;
        tx_done.send(()).unwrap();
        txn.await.unwrap();

        let system: Vec<_> = store.list("system").await.unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(system[0].payload, json!({"keep": 1}));
        assert!(store.list("worker.a").await.unwrap().is_empty());
        assert_eq!(store.list("kill_switch").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pruning_waits_for_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 2);
        write(&store, "system", json!({"v": 1})).await;

        transaction_scope(async {
            let sp = store.savepoint().await.unwrap();
            write(&store, "system", json!({"v": 2})).await;
            write(&store, "system", json!({"v": 3})).await;
            assert_eq!(store.list("system").await.unwrap().len(), 3);
            store.rollback(sp).await.unwrap();
        })
        .await;

        let latest = store.latest_valid("system").await.unwrap().unwrap();
        assert_eq!(latest.payload, json!({"v": 1}));

        transaction_scope(async {
            let sp = store.savepoint().await.unwrap();
            write(&store, "system", json!({"v": 4})).await;
            write(&store, "system", json!({"v": 5})).await;
            store.commit(sp).await.unwrap();
        })
        .await;

        let vs: Vec<_> = store
            .list("system")
            .await
            .unwrap()
            .iter()
            .map(|c| c.payload["v"].as_i64().unwrap())
            .collect();
        assert_eq!(vs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_nested_commit_rolls_back_with_outer() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);

        transaction_scope(async {
            let outer = store.savepoint().await.unwrap();
            transaction_scope(async {
                let inner = store.savepoint().await.unwrap();
                write(&store, "system", json!({"inner": true})).await;
                store.commit(inner).await.unwrap();
            })
            .await;
            store.rollback(outer).await.unwrap();
        })
        .await;

        assert!(store.list("system").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_savepoint_requires_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);
        assert!(matches!(
            store.savepoint().await,
            Err(WardenError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_state_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path(), 10);
        let err = store.append(&cp("../escape", json!({}))).await.unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }
}
