//! Atomic file I/O: write-to-temp-then-rename for single files, and a
//! staging-directory transaction for multi-file operations that must land
//! as a unit or not at all.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use tokio::fs;

use crate::error::{Result, StoreError};

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| {
            let c = rng.gen_range(0..36);
            std::char::from_digit(c, 36).unwrap()
        })
        .collect()
}

fn io_write(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoWrite {
        path: path.display().to_string(),
        source,
    }
}

fn io_read(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoRead {
        path: path.display().to_string(),
        source,
    }
}

fn io_remove(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoRemove {
        path: path.display().to_string(),
        source,
    }
}

fn io_list(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoList {
        path: path.display().to_string(),
        source,
    }
}

fn io_dir(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::IoDirectory {
        path: path.display().to_string(),
        source,
    }
}

/// True if `err` is a transient rename failure that is worth one retry.
/// Such errors are only observed on Windows, where a concurrent reader with
/// the destination open can cause a sharing violation or access-denied
/// result for a rename that would otherwise succeed.
#[cfg(windows)]
fn is_transient_rename_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(err.kind(), ErrorKind::PermissionDenied) || err.raw_os_error() == Some(32)
}

#[cfg(not(windows))]
fn is_transient_rename_error(_err: &std::io::Error) -> bool {
    false
}

async fn rename_with_retry(from: &Path, to: &Path) -> std::io::Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(err) if is_transient_rename_error(&err) => {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fs::rename(from, to).await
        }
        Err(err) => Err(err),
    }
}

/// Best-effort directory fsync so the rename itself is durable. Only
/// meaningful on Unix; opening a directory as a file handle fails on
/// Windows, so this is a no-op there. Per §7's propagation rules, a
/// directory-fsync failure is debug-logged, never surfaced as an error —
/// the rename it follows has already completed and is itself durable on
/// any filesystem with a journal, so this is pure best-effort belt-and-
/// braces durability.
#[cfg(unix)]
async fn fsync_dir(dir: &Path) {
    let dir = dir.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::open(&dir).and_then(|file| file.sync_all())
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::debug!("best-effort directory fsync failed: {err}"),
        Err(err) => tracing::debug!("directory fsync task panicked: {err}"),
    }
}

#[cfg(not(unix))]
async fn fsync_dir(_dir: &Path) {}

/// Opens the sibling temp file with mode `0600` on Unix. On other platforms
/// there is no equivalent permission bit to set at creation time, so this
/// just creates the file.
#[cfg(unix)]
async fn create_tmp_file(tmp_path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(tmp_path)
        .await
}

#[cfg(not(unix))]
async fn create_tmp_file(tmp_path: &Path) -> std::io::Result<fs::File> {
    fs::File::create(tmp_path).await
}

/// Writes `bytes` to `path` atomically: write to a sibling temp file, fsync
/// it, rename over the destination, then best-effort fsync the parent
/// directory so the rename itself is durable.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        StoreError::internal(format!("path {path:?} has no parent directory"))
    })?;
    fs::create_dir_all(parent).await.map_err(|e| io_dir(parent, e))?;

    let tmp_name = format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("doc"),
        random_suffix()
    );
    let tmp_path = parent.join(tmp_name);

    let write_result = async {
        let mut file = create_tmp_file(&tmp_path).await.map_err(|e| io_write(&tmp_path, e))?;
        use tokio::io::AsyncWriteExt;
        file.write_all(bytes).await.map_err(|e| io_write(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_write(&tmp_path, e))?;
        Ok::<(), StoreError>(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = rename_with_retry(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(io_write(path, err));
    }

    fsync_dir(parent).await;
    Ok(())
}

/// Reads a document's raw bytes, or `None` if it does not exist.
pub async fn read_document(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_read(path, err)),
    }
}

/// Removes a document, returning `false` if it did not exist.
pub async fn remove_document(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => {
            if let Some(parent) = path.parent() {
                fsync_dir(parent).await;
            }
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(io_remove(path, err)),
    }
}

/// Lists the file names (not full paths) directly inside `dir`, or an empty
/// vector if the directory does not exist. Excludes symbolic links and
/// subdirectories — only plain file entries are returned. `ext`, when
/// given, filters to names ending with that suffix (e.g. `".json"`).
pub async fn list_files(dir: &Path, ext: Option<&str>) -> Result<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(io_list(dir, err)),
    };

    let mut names = Vec::new();
    loop {
        let entry = entries.next_entry().await.map_err(|e| io_list(dir, e))?;
        let Some(entry) = entry else { break };
        let file_type = entry.file_type().await.map_err(|e| io_list(dir, e))?;
        if !file_type.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if ext.is_some_and(|ext| !name.ends_with(ext)) {
                continue;
            }
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// A staging directory that collects writes and either commits them all
/// atomically (rename the staging directory into place) or discards them
/// entirely. Used for multi-file operations (hierarchy moves, rebuilds)
/// where a partial result must never be observable.
pub struct DirTransaction {
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl DirTransaction {
    /// Begins a transaction whose eventual target is `target_root`. The
    /// staging directory is a sibling of `target_root` so the final commit
    /// is a same-filesystem rename.
    pub async fn begin(target_root: &Path) -> Result<Self> {
        let parent = target_root.parent().ok_or_else(|| {
            StoreError::internal(format!("{target_root:?} has no parent directory"))
        })?;
        let staging = parent.join(format!(".txn.{}", random_suffix()));
        fs::create_dir_all(&staging).await.map_err(|e| io_dir(&staging, e))?;
        Ok(Self {
            staging,
            target: target_root.to_path_buf(),
            committed: false,
        })
    }

    /// Writes canonical JSON bytes to `relative` inside the staging area.
    pub async fn write_json(&self, relative: &Path, bytes: &[u8]) -> Result<()> {
        self.write_file(relative, bytes).await
    }

    /// Writes arbitrary bytes to `relative` inside the staging area.
    pub async fn write_file(&self, relative: &Path, bytes: &[u8]) -> Result<()> {
        let dest = self.staging.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_dir(parent, e))?;
        }
        fs::write(&dest, bytes).await.map_err(|e| io_write(&dest, e))
    }

    /// Recursively copies `source` into `relative` inside the staging area.
    pub async fn copy_tree(&self, source: &Path, relative: &Path) -> Result<()> {
        let dest = self.staging.join(relative);
        copy_tree_inner(source, &dest).await
    }

    /// Commits the transaction: renames the staging directory over the
    /// target, replacing anything already there.
    pub async fn commit(self) -> Result<()> {
        self.commit_validated(|_staging| Ok(())).await
    }

    /// Commits the transaction, first running `validator` against the
    /// staging directory. Used to re-check for symlinks planted between
    /// `begin` and `commit`, narrowing (not eliminating) the TOCTOU window
    /// a long-lived transaction leaves open.
    pub async fn commit_validated<F>(mut self, validator: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        validator(&self.staging)?;

        let parent = self.target.parent().ok_or_else(|| {
            StoreError::internal(format!("{:?} has no parent directory", self.target))
        })?;

        if fs::try_exists(&self.target).await.map_err(|e| io_dir(&self.target, e))? {
            let backup = parent.join(format!(".txn.bak.{}", random_suffix()));
            fs::rename(&self.target, &backup).await.map_err(|e| io_write(&self.target, e))?;
            if let Err(err) = rename_with_retry(&self.staging, &self.target).await {
                let _ = fs::rename(&backup, &self.target).await;
                return Err(io_write(&self.target, err));
            }
            let _ = fs::remove_dir_all(&backup).await;
        } else {
            rename_with_retry(&self.staging, &self.target)
                .await
                .map_err(|e| io_write(&self.target, e))?;
        }

        fsync_dir(parent).await;
        self.committed = true;
        Ok(())
    }

    /// Discards the transaction, removing the staging directory.
    pub async fn abort(mut self) -> Result<()> {
        let result = fs::remove_dir_all(&self.staging).await;
        self.committed = true;
        match result {
            Ok(()) | Err(_) if !self.staging.exists() => Ok(()),
            Err(err) => Err(io_remove(&self.staging, err)),
        }
    }
}

impl Drop for DirTransaction {
    fn drop(&mut self) {
        if !self.committed {
            let staging = self.staging.clone();
            // Best effort: an uncommitted transaction leaves its staging
            // directory behind for `reap()`-style cleanup to find later,
            // rather than blocking a drop on async filesystem I/O.
            let _ = std::fs::remove_dir_all(&staging);
        }
    }
}

fn copy_tree_inner<'a>(source: &'a Path, dest: &'a Path) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = fs::metadata(source).await.map_err(|e| io_read(source, e))?;
        if metadata.is_dir() {
            fs::create_dir_all(dest).await.map_err(|e| io_dir(dest, e))?;
            let mut entries = fs::read_dir(source).await.map_err(|e| io_list(source, e))?;
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_list(source, e))? {
                let child_source = entry.path();
                let child_dest = dest.join(entry.file_name());
                copy_tree_inner(&child_source, &child_dest).await?;
            }
            Ok(())
        } else {
            fs::copy(source, dest).await.map_err(|e| io_write(dest, e))?;
            Ok(())
        }
    })
}
