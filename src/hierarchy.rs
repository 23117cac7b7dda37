//! Materialized-path hierarchy. A file lock serializes hierarchical writes
//! in-process (and across processes via exclusive-create semantics); the
//! by-path sidecar is kept coherent through a WAL-backed [`IndexTxn`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::atomic_io;
use crate::canonical::{self, CanonicalOptions};
use crate::error::{Result, StoreError};
use crate::types::MaterializedPath;
use crate::wal::{DocChange, IndexAdapter, IndexTxn, Wal, WalManifest, WalOperation};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

fn io_write(path: &std::path::Path, source: std::io::Error) -> StoreError {
    StoreError::IoWrite {
        path: path.display().to_string(),
        source,
    }
}

/// Stages/removes `<root>/_indexes/by-path/<segments>/<leaf>.json` sidecars.
/// The only [`IndexAdapter`] the core ships.
pub struct ByPathAdapter {
    root: PathBuf,
}

impl ByPathAdapter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The root path (`"/"`) has no segments; its sidecar lives directly
    /// under `by-path/` under a reserved leaf name since it has no parent
    /// segment to serve as a file name.
    pub fn sidecar_path(&self, path: &MaterializedPath) -> PathBuf {
        let by_path_root = self.root.join("_indexes").join("by-path");
        let segments = path.segments();
        if segments.is_empty() {
            return by_path_root.join("_root.json");
        }
        let mut dir = by_path_root;
        for segment in &segments[..segments.len() - 1] {
            dir = dir.join(segment);
        }
        dir.join(format!("{}.json", segments[segments.len() - 1]))
    }

    fn decode_path(value: Option<&Value>) -> Option<MaterializedPath> {
        value
            .and_then(|v| v.as_str())
            .and_then(|s| MaterializedPath::new(s).ok())
    }
}

#[async_trait]
impl IndexAdapter for ByPathAdapter {
    async fn prepare(&self, change: &DocChange, scratch_dir: &std::path::Path) -> Result<Vec<WalOperation>> {
        let old_path = Self::decode_path(change.old_value.as_ref());
        let new_path = Self::decode_path(change.new_value.as_ref());

        // Out-of-band delete of the stale entry. Not staged through the
        // WAL: idempotent to re-issue on replay, so it is safe to perform
        // immediately even though it will not be undone on rollback.
        if let Some(old) = &old_path {
            if new_path.as_ref() != Some(old) {
                let stale = self.sidecar_path(old);
                let _ = atomic_io::remove_document(&stale).await;
            }
        }

        let Some(new_path) = new_path else {
            return Ok(Vec::new());
        };

        let target = self.sidecar_path(&new_path);
        let doc = serde_json::json!({ "id": change.doc_id, "type": change.entity_type });
        let bytes = canonical::canonicalize(&doc, &CanonicalOptions::default())?;

        let rel = format!("by-path-{}.json", change.doc_id);
        let staged = scratch_dir.join(&rel);
        fs::write(&staged, &bytes).await.map_err(|e| io_write(&staged, e))?;

        Ok(vec![WalOperation {
            source: rel,
            target: target.display().to_string(),
            hash: canonical::content_hash(&bytes),
        }])
    }

    async fn rollback(&self, change: &DocChange) -> Result<()> {
        if let Some(new_path) = Self::decode_path(change.new_value.as_ref()) {
            let target = self.sidecar_path(&new_path);
            let _ = atomic_io::remove_document(&target).await;
        }
        Ok(())
    }
}

/// Holds `<root>/_meta/hierarchy.lock` for as long as it lives; the file is
/// removed when dropped.
pub struct HierarchyLock {
    path: PathBuf,
}

impl Drop for HierarchyLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Drives hierarchical writes through a file lock and a WAL-backed
/// by-path index transaction.
pub struct HierarchyManager {
    root: PathBuf,
    wal: Wal,
    adapter: ByPathAdapter,
}

impl HierarchyManager {
    pub fn new(root: PathBuf) -> Self {
        let wal = Wal::new(root.clone());
        let adapter = ByPathAdapter::new(root.clone());
        Self { root, wal, adapter }
    }

    fn lock_path(&self) -> PathBuf {
        self.root.join("_meta").join("hierarchy.lock")
    }

    /// Acquires the hierarchy lock, retrying every 100ms up to 30s.
    pub async fn acquire_lock(&self) -> Result<HierarchyLock> {
        self.acquire_lock_with_timeout(LOCK_TIMEOUT).await
    }

    async fn acquire_lock_with_timeout(&self, timeout: Duration) -> Result<HierarchyLock> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_write(parent, e))?;
        }

        let started = Instant::now();
        loop {
            let mut open = fs::OpenOptions::new();
            open.write(true).create_new(true);
            match open.open(&path).await {
                Ok(mut file) => {
                    let payload = serde_json::json!({
                        "pid": std::process::id(),
                        "acquiredAt": chrono::Utc::now().to_rfc3339(),
                    });
                    let bytes = canonical::canonicalize(&payload, &CanonicalOptions::default())?;
                    file.write_all(&bytes).await.map_err(|e| io_write(&path, e))?;
                    file.sync_all().await.map_err(|e| io_write(&path, e))?;
                    return Ok(HierarchyLock { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(StoreError::Lock(timeout));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(err) => return Err(io_write(&path, err)),
            }
        }
    }

    async fn run_txn(&self, millis: u128, change: DocChange) -> Result<()> {
        let (txn_id, scratch) = self.wal.begin(millis).await?;
        let txn = IndexTxn::new(vec![&self.adapter]);

        match txn.prepare_all(&change, &scratch).await {
            Ok(operations) => {
                if operations.is_empty() {
                    self.wal.rollback(&txn_id).await?;
                    return Ok(());
                }
                self.wal.prepare(&txn_id, operations.clone()).await?;
                let manifest = WalManifest {
                    txn_id: txn_id.clone(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                    operations,
                };
                self.wal.commit(&txn_id, &manifest).await
            }
            Err(err) => {
                let _ = self.wal.rollback(&txn_id).await;
                Err(err)
            }
        }
    }

    /// Updates the by-path sidecar for a `put`. `old_path`/`new_path` are
    /// `None` when the document had/has no `path` field.
    pub async fn put_hierarchical(
        &self,
        millis: u128,
        entity_type: &str,
        doc_id: &str,
        old_path: Option<&MaterializedPath>,
        new_path: Option<&MaterializedPath>,
    ) -> Result<()> {
        let _lock = self.acquire_lock().await?;
        let change = DocChange {
            entity_type: entity_type.to_string(),
            doc_id: doc_id.to_string(),
            old_value: old_path.map(|p| Value::String(p.as_str().to_string())),
            new_value: new_path.map(|p| Value::String(p.as_str().to_string())),
        };
        self.run_txn(millis, change).await
    }

    /// Removes the by-path sidecar for a `remove` of a document that had
    /// `old_path` set.
    pub async fn remove_hierarchical(
        &self,
        millis: u128,
        entity_type: &str,
        doc_id: &str,
        old_path: &MaterializedPath,
    ) -> Result<()> {
        let _lock = self.acquire_lock().await?;
        let change = DocChange {
            entity_type: entity_type.to_string(),
            doc_id: doc_id.to_string(),
            old_value: Some(Value::String(old_path.as_str().to_string())),
            new_value: None,
        };
        self.run_txn(millis, change).await
    }

    /// Reads the `{id, type}` sidecar for `path`, if any.
    pub async fn get_by_path(&self, path: &MaterializedPath) -> Result<Option<Value>> {
        let sidecar = self.adapter.sidecar_path(path);
        match atomic_io::read_document(&sidecar).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(canonical::safe_parse(&sidecar.display().to_string(), &bytes)?)),
        }
    }

    /// Rebuilds the entire by-path tree from scratch. `docs` is
    /// `(entity_type, doc_id, path)` for every document that currently
    /// carries a `path`. Returns the number of sidecars written.
    pub async fn repair(&self, docs: &[(String, String, MaterializedPath)]) -> Result<usize> {
        let by_path_root = self.root.join("_indexes").join("by-path");
        let _ = fs::remove_dir_all(&by_path_root).await;

        let mut written = 0;
        for (entity_type, doc_id, path) in docs {
            let target = self.adapter.sidecar_path(path);
            let value = serde_json::json!({ "id": doc_id, "type": entity_type });
            let bytes = canonical::canonicalize(&value, &CanonicalOptions::default())?;
            atomic_io::atomic_write(&target, &bytes).await?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Slug;

    fn path(segments: &[&str]) -> MaterializedPath {
        let mut p = MaterializedPath::root();
        for segment in segments {
            p = p.child(&Slug::new(*segment).unwrap());
        }
        p
    }

    #[tokio::test]
    async fn put_then_get_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        let us = path(&["us"]);

        manager
            .put_hierarchical(1, "region", "us", None, Some(&us))
            .await
            .unwrap();

        let found = manager.get_by_path(&us).await.unwrap().unwrap();
        assert_eq!(found["id"], "us");
        assert_eq!(found["type"], "region");
    }

    #[tokio::test]
    async fn put_moving_path_removes_old_entry() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        let us = path(&["us"]);
        let us_ca = path(&["us", "ca"]);

        manager
            .put_hierarchical(1, "region", "us-1", None, Some(&us))
            .await
            .unwrap();
        manager
            .put_hierarchical(2, "region", "us-1", Some(&us), Some(&us_ca))
            .await
            .unwrap();

        assert!(manager.get_by_path(&us).await.unwrap().is_none());
        assert!(manager.get_by_path(&us_ca).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_hierarchical_clears_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        let us = path(&["us"]);

        manager
            .put_hierarchical(1, "region", "us", None, Some(&us))
            .await
            .unwrap();
        manager.remove_hierarchical(2, "region", "us", &us).await.unwrap();

        assert!(manager.get_by_path(&us).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repair_rebuilds_tree_from_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        let us = path(&["us"]);
        let us_ca = path(&["us", "ca"]);

        let docs = vec![
            ("region".to_string(), "us".to_string(), us.clone()),
            ("region".to_string(), "us-ca".to_string(), us_ca.clone()),
        ];
        let count = manager.repair(&docs).await.unwrap();
        assert_eq!(count, 2);
        assert!(manager.get_by_path(&us).await.unwrap().is_some());
        assert!(manager.get_by_path(&us_ca).await.unwrap().is_some());

        let count_again = manager.repair(&docs).await.unwrap();
        assert_eq!(count_again, 2);
    }

    #[tokio::test]
    async fn lock_acquisition_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        let _held = manager.acquire_lock().await.unwrap();

        let err = manager
            .acquire_lock_with_timeout(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "lock");
    }

    #[tokio::test]
    async fn lock_release_allows_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let manager = HierarchyManager::new(dir.path().to_path_buf());
        {
            let _held = manager.acquire_lock().await.unwrap();
        }
        let reacquired = manager.acquire_lock_with_timeout(Duration::from_secs(1)).await;
        assert!(reacquired.is_ok());
    }
}
