//! Write-ahead log. Turns a collection of sidecar updates from several
//! "index adapters" into an all-or-nothing outcome with crash recovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::canonical;
use crate::error::{Result, StoreError};

/// One staged file within a transaction: where it lives in the scratch
/// directory, where it lands on commit, and a content hash for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalOperation {
    pub source: String,
    pub target: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalManifest {
    pub txn_id: String,
    pub created_at: String,
    pub operations: Vec<WalOperation>,
}

/// A pending change an [`IndexAdapter`] stages into the transaction's
/// scratch directory.
#[derive(Debug, Clone)]
pub struct DocChange {
    pub entity_type: String,
    pub doc_id: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// A capability that can stage file operations for a WAL transaction and,
/// if the transaction is abandoned before it commits, undo anything it did
/// outside the scratch directory (out-of-band deletes, for instance).
#[async_trait]
pub trait IndexAdapter: Send + Sync {
    /// Stages any files this adapter needs under `scratch_dir`, returning
    /// the operations describing where each will land.
    async fn prepare(&self, change: &DocChange, scratch_dir: &Path) -> Result<Vec<WalOperation>>;

    /// Undoes out-of-band side effects performed during `prepare` for a
    /// transaction that will not commit. Defaults to a no-op: most adapters
    /// only write into the scratch directory, which the WAL itself cleans
    /// up on rollback.
    async fn rollback(&self, _change: &DocChange) -> Result<()> {
        Ok(())
    }
}

/// Bundles several adapters' staged operations into one transaction,
/// rolling every adapter back if any one of them fails to prepare.
pub struct IndexTxn<'a> {
    adapters: Vec<&'a dyn IndexAdapter>,
}

impl<'a> IndexTxn<'a> {
    pub fn new(adapters: Vec<&'a dyn IndexAdapter>) -> Self {
        Self { adapters }
    }

    /// Runs every adapter's `prepare` against `scratch_dir`. On the first
    /// failure, rolls back every adapter that already succeeded.
    pub async fn prepare_all(&self, change: &DocChange, scratch_dir: &Path) -> Result<Vec<WalOperation>> {
        let mut operations = Vec::new();
        let mut prepared = Vec::new();

        for adapter in &self.adapters {
            match adapter.prepare(change, scratch_dir).await {
                Ok(ops) => {
                    operations.extend(ops);
                    prepared.push(*adapter);
                }
                Err(err) => {
                    for done in prepared.iter().rev() {
                        if let Err(rollback_err) = done.rollback(change).await {
                            warn!("rollback failed during prepare_all unwind: {rollback_err}");
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(operations)
    }
}

/// One hour: the age past which an unattended transaction directory is
/// considered orphaned and safe to reap.
const REAP_AGE: Duration = Duration::from_secs(3600);

pub struct Wal {
    root: PathBuf,
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoWrite {
        path: path.display().to_string(),
        source,
    }
}

impl Wal {
    /// `root` is the store root; transaction directories live at
    /// `<root>/_meta/wal/<txnId>/`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn wal_root(&self) -> PathBuf {
        self.root.join("_meta").join("wal")
    }

    fn txn_dir(&self, txn_id: &str) -> PathBuf {
        self.wal_root().join(txn_id)
    }

    /// Begins a new transaction, creating its scratch directory.
    /// `millis` is caller-supplied since the crate does not call
    /// `SystemTime::now()` internally outside the store facade.
    pub async fn begin(&self, millis: u128) -> Result<(String, PathBuf)> {
        let txn_id = format!("{millis}-{}", random_hex(8));
        let dir = self.txn_dir(&txn_id);
        fs::create_dir_all(&dir).await.map_err(|e| io_err(&dir, e))?;
        Ok((txn_id, dir))
    }

    /// Persists `operations` as `manifest.json` in the transaction
    /// directory and fsyncs it. After this returns, the transaction is
    /// recoverable: a crash before commit will be replayed by `recover()`.
    pub async fn prepare(&self, txn_id: &str, operations: Vec<WalOperation>) -> Result<()> {
        let dir = self.txn_dir(txn_id);
        let manifest = WalManifest {
            txn_id: txn_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            operations,
        };
        let bytes = canonical::canonicalize(
            &serde_json::to_value(&manifest).map_err(|source| StoreError::Parse {
                path: "manifest".to_string(),
                source,
            })?,
            &canonical::CanonicalOptions::default(),
        )?;
        let manifest_path = dir.join("manifest.json");
        fs::write(&manifest_path, &bytes)
            .await
            .map_err(|e| io_err(&manifest_path, e))?;
        fsync_best_effort(&dir).await;
        Ok(())
    }

    /// Commits a prepared transaction: for each operation, ensures the
    /// target directory exists and renames source over target, then
    /// removes the transaction directory. A missing source (the rename
    /// already happened on a prior, interrupted attempt) is not an error —
    /// commit and `recover()` replay must both be idempotent.
    pub async fn commit(&self, txn_id: &str, manifest: &WalManifest) -> Result<()> {
        let dir = self.txn_dir(txn_id);
        for op in &manifest.operations {
            let source = dir.join(&op.source);
            let target = PathBuf::from(&op.target);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(|e| io_err(parent, e))?;
            }
            match fs::rename(&source, &target).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!("wal commit: source {source:?} already moved, treating as replayed");
                }
                Err(err) => return Err(io_err(&target, err)),
            }
        }
        let _ = fs::remove_dir_all(&dir).await;
        Ok(())
    }

    /// Discards a transaction before it has been prepared. Only legal
    /// before `prepare` has persisted a manifest.
    pub async fn rollback(&self, txn_id: &str) -> Result<()> {
        let dir = self.txn_dir(txn_id);
        if dir.join("manifest.json").exists() {
            return Err(StoreError::Wal {
                txn_id: txn_id.to_string(),
                reason: "cannot roll back a transaction after prepare has persisted a manifest"
                    .to_string(),
            });
        }
        let _ = fs::remove_dir_all(&dir).await;
        Ok(())
    }

    /// Replays every transaction directory under `_meta/wal/`: a directory
    /// with a parseable manifest is committed; anything else is deleted.
    /// Returns the number of transactions replayed.
    pub async fn recover(&self) -> Result<usize> {
        let wal_root = self.wal_root();
        let mut entries = match fs::read_dir(&wal_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_err(&wal_root, err)),
        };

        let mut replayed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&wal_root, e))? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let txn_id = entry.file_name().to_string_lossy().to_string();
            let manifest_path = dir.join("manifest.json");

            match fs::read(&manifest_path).await {
                Ok(bytes) => match canonical::safe_parse(&manifest_path.display().to_string(), &bytes)
                    .ok()
                    .and_then(|v| serde_json::from_value::<WalManifest>(v).ok())
                {
                    Some(manifest) => {
                        self.commit(&txn_id, &manifest).await?;
                        replayed += 1;
                    }
                    None => {
                        let _ = fs::remove_dir_all(&dir).await;
                    }
                },
                Err(_) => {
                    let _ = fs::remove_dir_all(&dir).await;
                }
            }
        }
        Ok(replayed)
    }

    /// Removes transaction directories older than [`REAP_AGE`]. Returns the
    /// number reaped. `now_millis` is caller-supplied for the same reason
    /// as `begin`.
    pub async fn reap(&self, now_millis: u128) -> Result<usize> {
        let wal_root = self.wal_root();
        let mut entries = match fs::read_dir(&wal_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_err(&wal_root, err)),
        };

        let mut reaped = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&wal_root, e))? {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let txn_id = entry.file_name().to_string_lossy().to_string();
            let Some((millis_str, _)) = txn_id.split_once('-') else {
                continue;
            };
            let Ok(created_millis) = millis_str.parse::<u128>() else {
                continue;
            };
            let age = now_millis.saturating_sub(created_millis);
            if age > REAP_AGE.as_millis() {
                let _ = fs::remove_dir_all(&dir).await;
                reaped += 1;
            }
        }
        Ok(reaped)
    }
}

#[cfg(unix)]
async fn fsync_best_effort(dir: &Path) {
    let dir = dir.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || std::fs::File::open(&dir).and_then(|f| f.sync_all())).await;
}

#[cfg(not(unix))]
async fn fsync_best_effort(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAdapter;

    #[async_trait]
    impl IndexAdapter for NoopAdapter {
        async fn prepare(&self, _change: &DocChange, _scratch_dir: &Path) -> Result<Vec<WalOperation>> {
            Ok(Vec::new())
        }
    }

    struct FailingAdapter;

    #[async_trait]
    impl IndexAdapter for FailingAdapter {
        async fn prepare(&self, _change: &DocChange, _scratch_dir: &Path) -> Result<Vec<WalOperation>> {
            Err(StoreError::internal("boom"))
        }
    }

    fn sample_change() -> DocChange {
        DocChange {
            entity_type: "users".to_string(),
            doc_id: "alice".to_string(),
            old_value: None,
            new_value: Some(serde_json::json!("/us/ca")),
        }
    }

    #[tokio::test]
    async fn begin_prepare_commit_moves_staged_file_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let wal = Wal::new(root.clone());

        let (txn_id, scratch) = wal.begin(1_700_000_000_000).await.unwrap();
        let staged = scratch.join("staged.json");
        fs::write(&staged, b"{}").await.unwrap();

        let target = root.join("by-path").join("staged.json");
        let operations = vec![WalOperation {
            source: "staged.json".to_string(),
            target: target.display().to_string(),
            hash: canonical::content_hash(b"{}"),
        }];

        wal.prepare(&txn_id, operations.clone()).await.unwrap();
        let manifest = WalManifest {
            txn_id: txn_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            operations,
        };
        wal.commit(&txn_id, &manifest).await.unwrap();

        assert!(target.exists());
        assert!(!wal.txn_dir(&txn_id).exists());
    }

    #[tokio::test]
    async fn rollback_refuses_after_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path().to_path_buf());
        let (txn_id, _scratch) = wal.begin(1).await.unwrap();
        wal.prepare(&txn_id, Vec::new()).await.unwrap();
        assert!(wal.rollback(&txn_id).await.is_err());
    }

    #[tokio::test]
    async fn recover_replays_prepared_transactions_and_deletes_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let wal = Wal::new(root.clone());

        let (txn_id, scratch) = wal.begin(2).await.unwrap();
        fs::write(scratch.join("a.json"), b"{}").await.unwrap();
        let target = root.join("a.json");
        wal.prepare(
            &txn_id,
            vec![WalOperation {
                source: "a.json".to_string(),
                target: target.display().to_string(),
                hash: canonical::content_hash(b"{}"),
            }],
        )
        .await
        .unwrap();

        let garbage_dir = wal.wal_root().join("garbage-txn");
        fs::create_dir_all(&garbage_dir).await.unwrap();

        let replayed = wal.recover().await.unwrap();
        assert_eq!(replayed, 1);
        assert!(target.exists());
        assert!(!garbage_dir.exists());
    }

    #[tokio::test]
    async fn index_txn_rolls_back_succeeded_adapters_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let noop = NoopAdapter;
        let failing = FailingAdapter;
        let txn = IndexTxn::new(vec![&noop, &failing]);
        let change = sample_change();
        let result = txn.prepare_all(&change, dir.path()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reap_removes_only_stale_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path().to_path_buf());
        let (old_id, _) = wal.begin(0).await.unwrap();
        let (fresh_id, _) = wal.begin(1_700_000_000_000).await.unwrap();

        let reaped = wal.reap(1_700_000_000_000).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(!wal.txn_dir(&old_id).exists());
        assert!(wal.txn_dir(&fresh_id).exists());
    }
}
