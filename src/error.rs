//! Stable error taxonomy for the store. Every public operation fails into one
//! of these kinds; the kind string is part of the contract and must not
//! change even if the message wording does.

use std::fmt;
use std::time::Duration;

/// Structured error carrying a stable kind alongside a human message and,
/// where applicable, the underlying cause.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to read {path}")]
    IoRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    IoWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {path}")]
    IoRemove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list {path}")]
    IoList {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("directory operation failed on {path}")]
    IoDirectory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON at {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cyclic structure encountered during canonicalization")]
    Cycle,

    #[error("WAL transaction {txn_id} failed: {reason}")]
    Wal { txn_id: String, reason: String },

    #[error("hierarchy lock acquisition timed out after {0:?}")]
    Lock(Duration),

    #[error("markdown sidecar path policy violation: {0}")]
    MarkdownPath(String),

    #[error("markdown sidecar integrity check failed: {0}")]
    MarkdownIntegrity(String),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl StoreError {
    /// The stable kind string from the error taxonomy. External callers
    /// (the CLI driver, telemetry sinks) should match on this, not on
    /// `Debug`/`Display` text or the enum variant.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not-found",
            StoreError::Validation(_) => "validation",
            StoreError::IoRead { .. } => "io.read",
            StoreError::IoWrite { .. } => "io.write",
            StoreError::IoRemove { .. } => "io.remove",
            StoreError::IoList { .. } => "io.list",
            StoreError::IoDirectory { .. } => "io.directory",
            StoreError::Parse { .. } => "parse",
            StoreError::Cycle => "cycle",
            StoreError::Wal { .. } => "wal",
            StoreError::Lock(_) => "lock",
            StoreError::MarkdownPath(_) => "markdown.path",
            StoreError::MarkdownIntegrity(_) => "markdown.integrity",
            StoreError::Internal(_) => "internal",
        }
    }

    /// The CLI collaborator's exit-code mapping from the error taxonomy.
    /// Kept on the core so a thin CLI wrapper doesn't need to reimplement it.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            "not-found" => 2,
            _ => 1,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        StoreError::NotFound(what.to_string())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        StoreError::Internal(message.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
