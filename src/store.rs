//! The store façade: the public contract that ties the atomic I/O layer,
//! canonical serializer, query evaluator, index manager, document cache,
//! WAL, and hierarchy manager together. `ObservedStore` wraps it with a
//! tracing span and a metric per public operation, grounded in the
//! teacher's `wrappers.rs` decorator stack.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::atomic_io;
use crate::cache::{DocumentCache, FileStat};
use crate::canonical::{self, CanonicalOptions};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::hierarchy::HierarchyManager;
use crate::index_manager::{IndexManager, IndexSummary};
use crate::observability::{log_operation, record_metric, MetricType, Operation, OperationContext};
use crate::query::{self, QuerySpec};
use crate::types::{DocKey, EntityType, MaterializedPath};
use crate::wal::Wal;

/// Pass-through options for `put`; the `git*` fields are handed to an
/// external version-control collaborator without interpretation.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub git_commit: Option<String>,
    pub git_batch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    pub git_commit: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    pub dry_run: bool,
    pub fail_fast: bool,
}

#[derive(Debug, Clone)]
pub enum FormatTarget {
    All,
    Type(String),
}

#[derive(Debug, Clone, Default)]
pub struct ReindexOptions {
    pub types: Option<Vec<String>>,
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Stats {
    pub count: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DetailedStats {
    pub count: usize,
    pub bytes: u64,
    pub avg_bytes: f64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub by_type: HashMap<String, Stats>,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

async fn file_stat(path: &Path) -> Option<FileStat> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64);
    Some(FileStat {
        mtime,
        size: Some(metadata.len()),
    })
}

fn require_string_field(document: &Value, field: &str) -> Result<String> {
    document
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::validation(format!("document is missing string field {field:?}")))
}

/// Best-effort: a document already on disk was valid under whatever
/// `maxDepth` was in force when it was written, so a parse failure here
/// (e.g. the store was reopened with a smaller `maxDepth`) degrades to
/// "no path" rather than blocking `get`/`remove`.
fn document_path(document: &Value, max_depth: usize) -> Option<MaterializedPath> {
    document
        .get("path")
        .and_then(Value::as_str)
        .and_then(|s| MaterializedPath::with_max_depth(s, max_depth).ok())
}

/// Strict: a `path` field on a document being `put` must be a valid
/// materialized path under the store's configured `maxDepth`, or the
/// write is rejected before anything reaches disk.
fn document_path_checked(document: &Value, max_depth: usize) -> Result<Option<MaterializedPath>> {
    match document.get("path").and_then(Value::as_str) {
        None => Ok(None),
        Some(s) => MaterializedPath::with_max_depth(s, max_depth).map(Some),
    }
}

/// A single equality condition that spans the entirety of a filter:
/// `{field: value}` or `{field: {$eq: value}}`. Anything more complex
/// (logical operators, multiple fields, range operators) returns `None`
/// and the façade falls back to the scan + evaluator path.
fn as_single_equality(filter: &Value) -> Option<(String, Value)> {
    let object = filter.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let (field, condition) = object.iter().next()?;
    if field.starts_with('$') {
        return None;
    }
    match condition {
        Value::Object(ops) if ops.len() == 1 => ops.get("$eq").map(|v| (field.clone(), v.clone())),
        Value::Object(_) => None,
        literal => Some((field.clone(), literal.clone())),
    }
}

fn without_filter(spec: &QuerySpec) -> QuerySpec {
    QuerySpec {
        filter: None,
        sort: spec.sort.clone(),
        projection: spec.projection.clone(),
        skip: spec.skip,
        limit: spec.limit,
    }
}

/// The document store. One instance owns one root directory.
pub struct Store {
    config: StoreConfig,
    canonical_opts: CanonicalOptions,
    cache: Mutex<DocumentCache>,
    index_manager: IndexManager,
    hierarchy: Option<HierarchyManager>,
}

impl Store {
    /// Opens (creating if necessary) a store at `config.root`. When
    /// hierarchy is enabled, WAL recovery runs to completion before this
    /// returns — a crash between `prepare` and `commit` must be replayed
    /// before the store serves its first public operation.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|source| StoreError::IoDirectory {
                path: config.root.display().to_string(),
                source,
            })?;

        let canonical_opts = CanonicalOptions {
            indent: config.indent,
            key_order: config.key_order.clone(),
            eol: crate::canonical::Eol::Lf,
            trailing_newline: true,
        };

        let hierarchy = if config.enable_hierarchy {
            let wal = Wal::new(config.root.clone());
            wal.recover().await?;
            Some(HierarchyManager::new(config.root.clone()))
        } else {
            None
        };

        let store = Self {
            index_manager: IndexManager::new(config.root.clone(), canonical_opts.clone()),
            cache: Mutex::new(DocumentCache::new(crate::cache::capacity_from_env(), None)),
            hierarchy,
            canonical_opts,
            config,
        };

        if store.config.enable_indexes {
            for (entity_type, fields) in store.config.indexes.clone() {
                let docs = store.load_all_docs(&entity_type).await?;
                for field in fields {
                    store.index_manager.ensure_index(&entity_type, &field, &docs).await?;
                }
            }
        }

        Ok(store)
    }

    fn path_for(&self, key: &DocKey) -> PathBuf {
        self.config.root.join(key.relative_path())
    }

    /// Inserts a cache entry and reports any evictions the insert caused
    /// as a metric, mirroring the teacher's `CachedStorage` hit/miss/
    /// eviction counter reporting in `wrappers.rs`.
    async fn set_cache_entry(&self, path: &Path, document: Value, stat: FileStat) {
        let mut cache = self.cache.lock().await;
        let evictions_before = cache.evictions();
        cache.set(path, document, stat);
        let evicted = cache.evictions() - evictions_before;
        if evicted > 0 {
            record_metric(MetricType::Counter { name: "cache.eviction", value: evicted });
        }
    }

    async fn load_all_docs(&self, entity_type: &str) -> Result<Vec<(String, Value)>> {
        let dir = self.config.root.join(entity_type);
        let names = atomic_io::list_files(&dir, Some(".json")).await?;
        let mut docs = Vec::with_capacity(names.len());
        for name in names {
            let Some(id) = name.strip_suffix(".json") else { continue };
            let path = dir.join(&name);
            if let Some(bytes) = atomic_io::read_document(&path).await? {
                let value = canonical::safe_parse(&path.display().to_string(), &bytes)?;
                docs.push((id.to_string(), value));
            }
        }
        Ok(docs)
    }

    async fn discover_entity_types(&self) -> Result<Vec<String>> {
        let root = &self.config.root;
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::IoList {
                    path: root.display().to_string(),
                    source,
                })
            }
        };

        let mut types = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| StoreError::IoList {
            path: root.display().to_string(),
            source,
        })? {
            let file_type = entry.file_type().await.map_err(|source| StoreError::IoList {
                path: root.display().to_string(),
                source,
            })?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('_') || name.starts_with('.') {
                continue;
            }
            types.push(name);
        }
        types.sort();
        Ok(types)
    }

    /// `put(key, document, opts)`. A no-op (no write, no index/hierarchy
    /// fanout) when the canonical bytes already on disk are identical.
    pub async fn put(&self, key: &DocKey, document: Value, opts: Option<PutOptions>) -> Result<()> {
        if let Some(opts) = &opts {
            if opts.git_commit.is_some() || opts.git_batch.is_some() {
                tracing::debug!(
                    git_commit = ?opts.git_commit,
                    git_batch = ?opts.git_batch,
                    "put options passed through to external git collaborator without interpretation"
                );
            }
        }
        if require_string_field(&document, "type")? != key.entity_type.as_str() {
            return Err(StoreError::validation("document.type does not match key"));
        }
        if require_string_field(&document, "id")? != key.id.as_str() {
            return Err(StoreError::validation("document.id does not match key"));
        }
        let new_path = document_path_checked(&document, self.config.max_depth)?;

        let canonical_bytes = canonical::canonicalize(&document, &self.canonical_opts)?;
        let path = self.path_for(key);

        let current_bytes = atomic_io::read_document(&path).await?;
        if current_bytes.as_deref() == Some(canonical_bytes.as_slice()) {
            return Ok(());
        }

        let old_doc = match &current_bytes {
            Some(bytes) => Some(canonical::safe_parse(&path.display().to_string(), bytes)?),
            None => None,
        };

        atomic_io::atomic_write(&path, &canonical_bytes).await?;

        self.cache.lock().await.delete(&path);
        if let Some(stat) = file_stat(&path).await {
            self.set_cache_entry(&path, document.clone(), stat).await;
        }

        let fields = self.index_manager.list_indexes(key.entity_type.as_str()).await?;
        for field in fields {
            let old_value = old_doc.as_ref().and_then(|d| d.get(&field)).cloned();
            let new_value = document.get(&field).cloned();
            self.index_manager
                .update_index(key.entity_type.as_str(), &field, key.id.as_str(), old_value.as_ref(), new_value.as_ref())
                .await?;
        }

        if let Some(hierarchy) = &self.hierarchy {
            let old_path = old_doc.as_ref().and_then(|d| document_path(d, self.config.max_depth));
            if old_path.is_some() || new_path.is_some() {
                hierarchy
                    .put_hierarchical(
                        now_millis(),
                        key.entity_type.as_str(),
                        key.id.as_str(),
                        old_path.as_ref(),
                        new_path.as_ref(),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// `get(key)` → document or absent.
    pub async fn get(&self, key: &DocKey) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let Some(stat) = file_stat(&path).await else {
            self.cache.lock().await.delete(&path);
            return Ok(None);
        };

        {
            let mut cache = self.cache.lock().await;
            if let Some(doc) = cache.get(&path, stat) {
                record_metric(MetricType::Counter { name: "cache.hit", value: 1 });
                return Ok(Some(doc));
            }
            record_metric(MetricType::Counter { name: "cache.miss", value: 1 });
        }

        let Some(bytes) = atomic_io::read_document(&path).await? else {
            return Ok(None);
        };
        let value = canonical::safe_parse(&path.display().to_string(), &bytes)?;
        let object = value
            .as_object()
            .ok_or_else(|| StoreError::validation("document is not an object"))?;
        if object.get("type").and_then(Value::as_str) != Some(key.entity_type.as_str())
            || object.get("id").and_then(Value::as_str) != Some(key.id.as_str())
        {
            return Err(StoreError::validation("document type/id does not match its key"));
        }

        self.set_cache_entry(&path, value.clone(), stat).await;
        Ok(Some(value))
    }

    /// `remove(key, opts)`. Idempotent: removing an absent key succeeds.
    pub async fn remove(&self, key: &DocKey, opts: Option<RemoveOptions>) -> Result<()> {
        if let Some(commit) = opts.as_ref().and_then(|o| o.git_commit.as_ref()) {
            tracing::debug!(
                git_commit = %commit,
                "remove options passed through to external git collaborator without interpretation"
            );
        }
        let path = self.path_for(key);
        let Some(bytes) = atomic_io::read_document(&path).await? else {
            return Ok(());
        };
        let old_doc = canonical::safe_parse(&path.display().to_string(), &bytes)?;

        atomic_io::remove_document(&path).await?;
        self.cache.lock().await.delete(&path);

        let fields = self.index_manager.list_indexes(key.entity_type.as_str()).await?;
        for field in fields {
            let old_value = old_doc.get(&field).cloned();
            self.index_manager
                .update_index(key.entity_type.as_str(), &field, key.id.as_str(), old_value.as_ref(), None)
                .await?;
        }

        if let Some(hierarchy) = &self.hierarchy {
            if let Some(old_path) = document_path(&old_doc, self.config.max_depth) {
                hierarchy
                    .remove_hierarchical(now_millis(), key.entity_type.as_str(), key.id.as_str(), &old_path)
                    .await?;
            }
        }

        Ok(())
    }

    /// `list(type)` → sorted ids.
    pub async fn list(&self, entity_type: &EntityType) -> Result<Vec<String>> {
        let dir = self.config.root.join(entity_type.as_str());
        let names = atomic_io::list_files(&dir, Some(".json")).await?;
        Ok(names
            .into_iter()
            .filter_map(|name| name.strip_suffix(".json").map(str::to_string))
            .collect())
    }

    async fn docs_for_type(&self, entity_type: &str) -> Result<Vec<Value>> {
        let ids = self.list(&EntityType::new(entity_type)?).await?;
        let mut docs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = self.get(&DocKey::new(entity_type, id)?).await? {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// `query(spec)`. Routes a single top-level equality filter through
    /// the id fast path or an existing index before falling back to a
    /// directory scan plus the evaluator.
    pub async fn query(&self, entity_type: Option<&EntityType>, spec: &QuerySpec) -> Result<Vec<Value>> {
        if let Some(filter) = &spec.filter {
            if let Some((field, value)) = as_single_equality(filter) {
                if field == "id" {
                    if let (Some(entity_type), Some(id)) = (entity_type, value.as_str()) {
                        let mut docs = Vec::new();
                        if let Some(doc) = self.get(&DocKey::new(entity_type.as_str(), id)?).await? {
                            docs.push(doc);
                        }
                        return query::evaluate(&docs, &without_filter(spec));
                    }
                } else if let Some(entity_type) = entity_type {
                    let indexed = self.index_manager.list_indexes(entity_type.as_str()).await?;
                    if indexed.iter().any(|f| f == &field) {
                        let ids = self
                            .index_manager
                            .query_with_index(entity_type.as_str(), &field, &value)
                            .await;
                        let mut docs = Vec::with_capacity(ids.len());
                        for id in ids {
                            if let Some(doc) = self.get(&DocKey::new(entity_type.as_str(), id)?).await? {
                                docs.push(doc);
                            }
                        }
                        return query::evaluate(&docs, &without_filter(spec));
                    }
                }
            }
        }

        let types = match entity_type {
            Some(t) => vec![t.as_str().to_string()],
            None => self.discover_entity_types().await?,
        };
        let mut docs = Vec::new();
        for t in types {
            docs.extend(self.docs_for_type(&t).await?);
        }
        query::evaluate(&docs, spec)
    }

    pub async fn ensure_index(&self, entity_type: &str, field: &str) -> Result<IndexSummary> {
        let docs = self.load_all_docs(entity_type).await?;
        self.index_manager.ensure_index(entity_type, field, &docs).await
    }

    pub async fn rebuild_indexes(
        &self,
        entity_type: &str,
        fields: Option<Vec<String>>,
        force: bool,
    ) -> Result<HashMap<String, IndexSummary>> {
        let docs = self.load_all_docs(entity_type).await?;
        self.index_manager
            .rebuild_indexes(entity_type, fields, force, &docs)
            .await
    }

    pub async fn reindex(&self, opts: ReindexOptions) -> Result<HashMap<String, HashMap<String, IndexSummary>>> {
        let types = match opts.types {
            Some(types) => types,
            None => self.discover_entity_types().await?,
        };
        let mut summaries = HashMap::new();
        for entity_type in types {
            let result = self.rebuild_indexes(&entity_type, None, opts.force).await?;
            summaries.insert(entity_type, result);
        }
        Ok(summaries)
    }

    fn require_hierarchy(&self) -> Result<&HierarchyManager> {
        self.hierarchy
            .as_ref()
            .ok_or_else(|| StoreError::validation("hierarchy is not enabled for this store"))
    }

    /// `getByPath(path)`. Requires `enableHierarchy`.
    pub async fn get_by_path(&self, path: &MaterializedPath) -> Result<Option<Value>> {
        self.require_hierarchy()?.get_by_path(path).await
    }

    /// `repairHierarchy()`. Rebuilds the entire by-path tree from every
    /// on-disk document that currently carries a `path` field. Requires
    /// `enableHierarchy`.
    pub async fn repair_hierarchy(&self) -> Result<usize> {
        let hierarchy = self.require_hierarchy()?;
        let types = self.discover_entity_types().await?;
        let mut docs = Vec::new();
        for entity_type in types {
            for doc in self.docs_for_type(&entity_type).await? {
                if let Some(path) = document_path(&doc, self.config.max_depth) {
                    let id = require_string_field(&doc, "id")?;
                    docs.push((entity_type.clone(), id, path));
                }
            }
        }
        hierarchy.repair(&docs).await
    }

    /// Reaps orphaned WAL transaction directories older than one hour.
    /// Requires `enableHierarchy`. `now_millis` is caller-supplied, matching
    /// the WAL's own convention of never calling `SystemTime::now()`
    /// internally.
    pub async fn reap_wal(&self, now_millis: u128) -> Result<usize> {
        self.require_hierarchy()?;
        Wal::new(self.config.root.clone()).reap(now_millis).await
    }

    /// `format(target, opts)` → count of documents reformatted (or that
    /// would be reformatted, under `dryRun`). Documents within one type
    /// directory are reformatted with up to `config.format_concurrency`
    /// in flight at once.
    pub async fn format(&self, target: FormatTarget, opts: FormatOptions) -> Result<usize> {
        use futures::stream::{self, StreamExt};

        let types = match target {
            FormatTarget::All => self.discover_entity_types().await?,
            FormatTarget::Type(t) => vec![t],
        };

        let mut reformatted = 0;
        for entity_type in types {
            let dir = self.config.root.join(&entity_type);
            let names = atomic_io::list_files(&dir, Some(".json")).await?;

            let results: Vec<Result<bool>> = stream::iter(names.into_iter().map(|name| {
                let path = dir.join(&name);
                async move {
                    let Some(bytes) = atomic_io::read_document(&path).await? else {
                        return Ok(false);
                    };
                    let value = canonical::safe_parse(&path.display().to_string(), &bytes)?;
                    let canonical_bytes = canonical::canonicalize(&value, &self.canonical_opts)?;
                    if canonical_bytes == bytes {
                        return Ok(false);
                    }
                    if !opts.dry_run {
                        atomic_io::atomic_write(&path, &canonical_bytes).await?;
                        self.cache.lock().await.delete(&path);
                    }
                    Ok(true)
                }
            }))
            .buffer_unordered(self.config.format_concurrency)
            .collect()
            .await;

            for result in results {
                match result {
                    Ok(true) => reformatted += 1,
                    Ok(false) => {}
                    Err(err) if opts.fail_fast => return Err(err),
                    Err(_) => {}
                }
            }
        }
        Ok(reformatted)
    }

    /// `stats(type?)` → `{count, bytes}`. Skips symlinked type directories
    /// and symlinked documents; reserved subtrees never count.
    pub async fn stats(&self, entity_type: Option<&str>) -> Result<Stats> {
        let types = match entity_type {
            Some(t) => vec![t.to_string()],
            None => self.discover_entity_types().await?,
        };

        let mut count = 0usize;
        let mut bytes = 0u64;
        for t in types {
            let (c, b) = self.type_stats(&t).await?;
            count += c;
            bytes += b;
        }
        Ok(Stats { count, bytes })
    }

    async fn type_stats(&self, entity_type: &str) -> Result<(usize, u64)> {
        let dir = self.config.root.join(entity_type);
        let metadata = match tokio::fs::symlink_metadata(&dir).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(source) => {
                return Err(StoreError::IoDirectory {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };
        if metadata.is_symlink() {
            return Ok((0, 0));
        }

        let names = atomic_io::list_files(&dir, Some(".json")).await?;
        let mut count = 0usize;
        let mut bytes = 0u64;
        for name in names {
            let path = dir.join(&name);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                count += 1;
                bytes += meta.len();
            }
        }
        Ok((count, bytes))
    }

    /// `detailedStats()` → adds `avgBytes`/`minBytes`/`maxBytes` and a
    /// per-type breakdown.
    pub async fn detailed_stats(&self) -> Result<DetailedStats> {
        let types = self.discover_entity_types().await?;
        let mut total = DetailedStats {
            min_bytes: u64::MAX,
            ..Default::default()
        };

        for t in types {
            let (count, bytes) = self.type_stats(&t).await?;
            total.count += count;
            total.bytes += bytes;
            total.by_type.insert(t.clone(), Stats { count, bytes });

            let dir = self.config.root.join(&t);
            let names = atomic_io::list_files(&dir, Some(".json")).await?;
            for name in names {
                if let Ok(meta) = tokio::fs::metadata(dir.join(&name)).await {
                    total.min_bytes = total.min_bytes.min(meta.len());
                    total.max_bytes = total.max_bytes.max(meta.len());
                }
            }
        }

        if total.count == 0 {
            total.min_bytes = 0;
        }
        total.avg_bytes = if total.count == 0 {
            0.0
        } else {
            total.bytes as f64 / total.count as f64
        };
        Ok(total)
    }

    /// `close()`. Every public mutation is already durable; there is no
    /// state to flush, only in-process resources to release.
    pub async fn close(&self) -> Result<()> {
        self.cache.lock().await.clear_all();
        Ok(())
    }
}

/// Wraps [`Store`] with a tracing span and a metric per public operation.
/// Pure delegation: no behavior change.
pub struct ObservedStore {
    inner: Store,
    trace_root: OperationContext,
}

impl ObservedStore {
    /// Establishes the trace id every operation on this store will share:
    /// generated once here, reused as the parent of each call's own
    /// [`OperationContext`] via [`OperationContext::child`].
    pub fn new(inner: Store) -> Self {
        Self {
            inner,
            trace_root: OperationContext::root("store"),
        }
    }

    async fn observe<T>(
        &self,
        op: Operation,
        attributes: &[(&str, String)],
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut ctx = self.trace_root.child(op.name());
        for (key, value) in attributes {
            ctx.add_attribute(*key, value.clone());
        }
        let span = tracing::info_span!(
            "store.operation",
            operation = op.name(),
            trace_id = %ctx.trace_id,
            span_id = %ctx.span_id
        );
        let result = fut.instrument(span).await;
        match &result {
            Ok(_) => log_operation(&ctx, op, Ok(())),
            Err(err) => log_operation(&ctx, op, Err(err)),
        }
        result
    }

    pub async fn put(&self, key: &DocKey, document: Value, opts: Option<PutOptions>) -> Result<()> {
        let mut attributes: Vec<(&str, String)> = Vec::new();
        if let Some(opts) = &opts {
            if let Some(commit) = &opts.git_commit {
                attributes.push(("git_commit", commit.clone()));
            }
            if let Some(batch) = &opts.git_batch {
                attributes.push(("git_batch", batch.clone()));
            }
        }
        self.observe(Operation::Put, &attributes, self.inner.put(key, document, opts)).await
    }

    pub async fn get(&self, key: &DocKey) -> Result<Option<Value>> {
        self.observe(Operation::Get, &[], self.inner.get(key)).await
    }

    pub async fn remove(&self, key: &DocKey, opts: Option<RemoveOptions>) -> Result<()> {
        let mut attributes: Vec<(&str, String)> = Vec::new();
        if let Some(opts) = &opts {
            if let Some(commit) = &opts.git_commit {
                attributes.push(("git_commit", commit.clone()));
            }
        }
        self.observe(Operation::Remove, &attributes, self.inner.remove(key, opts)).await
    }

    pub async fn list(&self, entity_type: &EntityType) -> Result<Vec<String>> {
        self.observe(Operation::List, &[], self.inner.list(entity_type)).await
    }

    pub async fn query(&self, entity_type: Option<&EntityType>, spec: &QuerySpec) -> Result<Vec<Value>> {
        self.observe(Operation::Query, &[], self.inner.query(entity_type, spec)).await
    }

    pub async fn ensure_index(&self, entity_type: &str, field: &str) -> Result<IndexSummary> {
        self.observe(Operation::EnsureIndex, &[], self.inner.ensure_index(entity_type, field))
            .await
    }

    pub async fn rebuild_indexes(
        &self,
        entity_type: &str,
        fields: Option<Vec<String>>,
        force: bool,
    ) -> Result<HashMap<String, IndexSummary>> {
        self.observe(
            Operation::RebuildIndexes,
            &[],
            self.inner.rebuild_indexes(entity_type, fields, force),
        )
        .await
    }

    pub async fn reindex(&self, opts: ReindexOptions) -> Result<HashMap<String, HashMap<String, IndexSummary>>> {
        self.observe(Operation::Reindex, &[], self.inner.reindex(opts)).await
    }

    pub async fn get_by_path(&self, path: &MaterializedPath) -> Result<Option<Value>> {
        self.observe(Operation::GetByPath, &[], self.inner.get_by_path(path)).await
    }

    pub async fn repair_hierarchy(&self) -> Result<usize> {
        self.observe(Operation::RepairHierarchy, &[], self.inner.repair_hierarchy()).await
    }

    pub async fn reap_wal(&self, now_millis: u128) -> Result<usize> {
        self.observe(Operation::ReapWal, &[], self.inner.reap_wal(now_millis)).await
    }

    pub async fn format(&self, target: FormatTarget, opts: FormatOptions) -> Result<usize> {
        self.observe(Operation::Format, &[], self.inner.format(target, opts)).await
    }

    pub async fn stats(&self, entity_type: Option<&str>) -> Result<Stats> {
        self.observe(Operation::Stats, &[], self.inner.stats(entity_type)).await
    }

    pub async fn detailed_stats(&self) -> Result<DetailedStats> {
        self.observe(Operation::Stats, &[], self.inner.detailed_stats()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.observe(Operation::Close, &[], self.inner.close()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfigBuilder;
    use crate::query::SortDirection;
    use serde_json::json;

    async fn open_store(dir: &std::path::Path) -> Store {
        let config = StoreConfigBuilder::new(dir).build().unwrap();
        Store::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let key = DocKey::new("task", "t1").unwrap();

        store
            .put(&key, json!({"type": "task", "id": "t1", "status": "open"}), None)
            .await
            .unwrap();
        let found = store.get(&key).await.unwrap().unwrap();
        assert_eq!(found["status"], "open");

        store.remove(&key, None).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_is_noop_when_bytes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let key = DocKey::new("task", "t1").unwrap();
        let doc = json!({"type": "task", "id": "t1", "status": "open"});

        store.put(&key, doc.clone(), None).await.unwrap();
        let path = store.path_for(&key);
        let mtime_before = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();

        store.put(&key, doc, None).await.unwrap();
        let mtime_after = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[tokio::test]
    async fn query_filters_sorts_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;

        for (id, status, priority) in [("t1", "open", 5), ("t2", "ready", 8), ("t3", "open", 3)] {
            store
                .put(
                    &DocKey::new("task", id).unwrap(),
                    json!({"type": "task", "id": id, "status": status, "priority": priority}),
                    None,
                )
                .await
                .unwrap();
        }

        let spec = QuerySpec {
            filter: Some(json!({"status": {"$eq": "open"}})),
            sort: Some(vec![("priority".to_string(), SortDirection::Descending)]),
            ..Default::default()
        };
        let results = store.query(Some(&EntityType::new("task").unwrap()), &spec).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|d| d["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn query_array_containment_and_nested_dot() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .put(
                &DocKey::new("user", "user-1").unwrap(),
                json!({
                    "type": "user",
                    "id": "user-1",
                    "tags": ["admin", "dev"],
                    "meta": {"owner": {"email": "a@x"}},
                }),
                None,
            )
            .await
            .unwrap();

        let by_tag = store
            .query(
                Some(&EntityType::new("user").unwrap()),
                &QuerySpec {
                    filter: Some(json!({"tags": {"$eq": "admin"}})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);

        let by_nested = store
            .query(
                Some(&EntityType::new("user").unwrap()),
                &QuerySpec {
                    filter: Some(json!({"meta.owner.email": {"$eq": "a@x"}})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_nested.len(), 1);
    }

    #[tokio::test]
    async fn index_stays_coherent_across_update() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfigBuilder::new(dir.path()).enable_indexes(true).build().unwrap();
        let store = Store::open(config).await.unwrap();
        store.ensure_index("task", "status").await.unwrap();

        let key = DocKey::new("task", "t1").unwrap();
        store
            .put(&key, json!({"type": "task", "id": "t1", "status": "open"}), None)
            .await
            .unwrap();
        let open_ids = store.index_manager.query_with_index("task", "status", &json!("open")).await;
        assert_eq!(open_ids, vec!["t1".to_string()]);

        store
            .put(&key, json!({"type": "task", "id": "t1", "status": "closed"}), None)
            .await
            .unwrap();
        let open_ids = store.index_manager.query_with_index("task", "status", &json!("open")).await;
        assert!(open_ids.is_empty());
        let closed_ids = store.index_manager.query_with_index("task", "status", &json!("closed")).await;
        assert_eq!(closed_ids, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn index_fanout_runs_even_when_enable_indexes_is_off() {
        // `enable_indexes` only controls auto-ensure-on-open; a sidecar
        // created explicitly via `ensure_index` must still be kept coherent
        // by `put`/`remove` regardless of that flag.
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store.ensure_index("task", "status").await.unwrap();

        let key = DocKey::new("task", "t1").unwrap();
        store
            .put(&key, json!({"type": "task", "id": "t1", "status": "open"}), None)
            .await
            .unwrap();
        let open_ids = store.index_manager.query_with_index("task", "status", &json!("open")).await;
        assert_eq!(open_ids, vec!["t1".to_string()]);

        store.remove(&key, None).await.unwrap();
        let open_ids = store.index_manager.query_with_index("task", "status", &json!("open")).await;
        assert!(open_ids.is_empty());
    }

    #[tokio::test]
    async fn canonical_form_and_format_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let key = DocKey::new("task", "t1").unwrap();
        store
            .put(&key, json!({"z": "last", "a": "first", "id": "t1", "type": "task"}), None)
            .await
            .unwrap();

        let path = store.path_for(&key);
        let bytes = tokio::fs::read(&path).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\n  \"a\": \"first\""));

        let reformatted = store.format(FormatTarget::All, FormatOptions::default()).await.unwrap();
        assert_eq!(reformatted, 0);
    }

    #[tokio::test]
    async fn format_dry_run_counts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let key = DocKey::new("task", "t1").unwrap();
        store
            .put(&key, json!({"type": "task", "id": "t1"}), None)
            .await
            .unwrap();

        // Hand-write a non-canonical file directly, bypassing `put`.
        let path = store.path_for(&key);
        tokio::fs::write(&path, b"{\"id\":\"t1\",\"type\":\"task\"}").await.unwrap();
        let before = tokio::fs::read(&path).await.unwrap();

        let count = store
            .format(FormatTarget::All, FormatOptions { dry_run: true, fail_fast: false })
            .await
            .unwrap();
        assert_eq!(count, 1);
        let after = tokio::fs::read(&path).await.unwrap();
        assert_eq!(before, after, "dry_run must not write");

        let count = store.format(FormatTarget::All, FormatOptions::default()).await.unwrap();
        assert_eq!(count, 1);
        let count = store.format(FormatTarget::All, FormatOptions::default()).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn cache_hit_and_miss_metrics_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let key = DocKey::new("task", "t1").unwrap();
        store
            .put(&key, json!({"type": "task", "id": "t1"}), None)
            .await
            .unwrap();

        let before = crate::observability::get_metrics();
        let misses_before = before["cache"]["misses"].as_u64().unwrap();

        store.get(&key).await.unwrap();
        let after_hit = crate::observability::get_metrics();
        assert!(after_hit["cache"]["hits"].as_u64().unwrap() >= 1);

        store.cache.lock().await.clear_all();
        store.get(&key).await.unwrap();
        let after_miss = crate::observability::get_metrics();
        assert!(after_miss["cache"]["misses"].as_u64().unwrap() > misses_before);
    }

    #[tokio::test]
    async fn hierarchical_put_is_queryable_by_path_and_repairable() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfigBuilder::new(dir.path()).enable_hierarchy(true).build().unwrap();
        let store = Store::open(config).await.unwrap();

        store
            .put(
                &DocKey::new("region", "us").unwrap(),
                json!({"type": "region", "id": "us", "path": "/us"}),
                None,
            )
            .await
            .unwrap();

        let found = store.get_by_path(&MaterializedPath::new("/us").unwrap()).await.unwrap().unwrap();
        assert_eq!(found["id"], "us");

        let repaired = store.repair_hierarchy().await.unwrap();
        assert_eq!(repaired, 1);
        assert!(store
            .get_by_path(&MaterializedPath::new("/us").unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn get_by_path_requires_hierarchy_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let err = store
            .get_by_path(&MaterializedPath::new("/us").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        assert!(DocKey::new("../etc", "passwd").is_err());
        assert!(DocKey::new("user", "../../etc/passwd").is_err());
        assert!(DocKey::new("CON", "x").is_err());
    }

    #[tokio::test]
    async fn put_rejects_path_deeper_than_configured_max_depth() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfigBuilder::new(dir.path())
            .enable_hierarchy(true)
            .max_depth(1)
            .build()
            .unwrap();
        let store = Store::open(config).await.unwrap();

        let err = store
            .put(
                &DocKey::new("region", "sf").unwrap(),
                json!({"type": "region", "id": "sf", "path": "/us/ca/sf"}),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn stats_and_list_reflect_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        store
            .put(
                &DocKey::new("task", "t1").unwrap(),
                json!({"type": "task", "id": "t1"}),
                None,
            )
            .await
            .unwrap();
        store
            .put(
                &DocKey::new("task", "t2").unwrap(),
                json!({"type": "task", "id": "t2"}),
                None,
            )
            .await
            .unwrap();

        let ids = store.list(&EntityType::new("task").unwrap()).await.unwrap();
        assert_eq!(ids, vec!["t1".to_string(), "t2".to_string()]);

        let stats = store.stats(Some("task")).await.unwrap();
        assert_eq!(stats.count, 2);
        assert!(stats.bytes > 0);
    }
}
