//! An embedded, file-backed JSON document store: atomic I/O, canonical
//! serialization, equality indexes, a Mango-style query evaluator, a
//! write-ahead log, and an optional materialized-path hierarchy.

pub mod atomic_io;
pub mod cache;
pub mod canonical;
pub mod config;
pub mod error;
pub mod hierarchy;
pub mod index_manager;
pub mod observability;
pub mod query;
pub mod store;
pub mod types;
pub mod validation;
pub mod wal;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{Result, StoreError};
pub use query::{QuerySpec, SortDirection};
pub use store::{
    DetailedStats, FormatOptions, FormatTarget, ObservedStore, PutOptions, ReindexOptions, RemoveOptions, Stats, Store,
};
pub use types::{DocKey, EntityId, EntityType, MaterializedPath, Slug};
