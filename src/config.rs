//! `StoreConfig`/`StoreConfigBuilder`. Validates the `openStore` surface
//! before handing the façade an immutable, known-good configuration —
//! following the teacher's `StorageConfigBuilder` pattern: each setter does
//! a local shape check, `build()` does cross-field checks and returns
//! `Result`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::canonical::KeyOrder;
use crate::error::{Result, StoreError};

/// Default hierarchical depth bound (§3 "Materialized path").
pub const DEFAULT_MAX_DEPTH: usize = 32;
const DEFAULT_INDENT: usize = 2;
const DEFAULT_FORMAT_CONCURRENCY: usize = 16;

/// Immutable, validated configuration for an open store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub indent: usize,
    pub key_order: KeyOrder,
    pub enable_indexes: bool,
    pub indexes: HashMap<String, Vec<String>>,
    pub enable_hierarchy: bool,
    pub max_depth: usize,
    pub format_concurrency: usize,
}

/// Builds a [`StoreConfig`], validating the `openStore` surface of the
/// spec's external-interfaces section. Unknown options are rejected
/// structurally: the builder exposes only the closed set of typed setters
/// below, so there is no "unrecognized key" to accidentally accept.
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    root: PathBuf,
    indent: usize,
    key_order: KeyOrder,
    enable_indexes: bool,
    indexes: HashMap<String, Vec<String>>,
    enable_hierarchy: bool,
    max_depth: usize,
    format_concurrency: usize,
}

impl StoreConfigBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            indent: DEFAULT_INDENT,
            key_order: KeyOrder::CodePoint,
            enable_indexes: false,
            indexes: HashMap::new(),
            enable_hierarchy: false,
            max_depth: DEFAULT_MAX_DEPTH,
            format_concurrency: DEFAULT_FORMAT_CONCURRENCY,
        }
    }

    pub fn indent(mut self, indent: usize) -> Self {
        self.indent = indent;
        self
    }

    /// `true` (code-point sort, the default), `false` (preserve insertion
    /// order), or an explicit priority key list.
    pub fn stable_key_order(mut self, order: KeyOrder) -> Self {
        self.key_order = order;
        self
    }

    pub fn enable_indexes(mut self, enable: bool) -> Self {
        self.enable_indexes = enable;
        self
    }

    /// Declares that `field` on `entity_type` should have an equality
    /// sidecar auto-ensured when the store opens.
    pub fn index(mut self, entity_type: impl Into<String>, field: impl Into<String>) -> Self {
        self.indexes
            .entry(entity_type.into())
            .or_default()
            .push(field.into());
        self
    }

    pub fn enable_hierarchy(mut self, enable: bool) -> Self {
        self.enable_hierarchy = enable;
        self
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn format_concurrency(mut self, concurrency: usize) -> Self {
        self.format_concurrency = concurrency;
        self
    }

    /// Validates cross-field constraints and returns the immutable config.
    pub fn build(self) -> Result<StoreConfig> {
        if self.root.as_os_str().is_empty() {
            return Err(StoreError::validation("root path cannot be empty"));
        }
        if !(1..=64).contains(&self.format_concurrency) {
            return Err(StoreError::validation(format!(
                "formatConcurrency {} must be between 1 and 64",
                self.format_concurrency
            )));
        }
        if self.max_depth == 0 {
            return Err(StoreError::validation("maxDepth must be at least 1"));
        }

        Ok(StoreConfig {
            root: self.root,
            indent: self.indent,
            key_order: self.key_order,
            enable_indexes: self.enable_indexes,
            indexes: self.indexes,
            enable_hierarchy: self.enable_hierarchy,
            max_depth: self.max_depth,
            format_concurrency: self.format_concurrency,
        })
    }
}
