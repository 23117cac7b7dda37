//! Validated newtypes. Every one of these is constructed through a fallible
//! constructor that routes through [`crate::validation`]; once built, the
//! value is known-good for the rest of its life.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::validation;

/// The `type` component of a document key, e.g. `"users"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validation::validate_key_component("type", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityType {
    type Error = crate::error::StoreError;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

/// The `id` component of a document key, e.g. `"alice"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validation::validate_key_component("id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = crate::error::StoreError;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

/// A validated `(type, id)` pair identifying a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub entity_type: EntityType,
    pub id: EntityId,
}

impl DocKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        Ok(Self {
            entity_type: EntityType::new(entity_type)?,
            id: EntityId::new(id)?,
        })
    }

    /// The relative file path this document lives at under the store root:
    /// `<type>/<id>.json`.
    pub fn relative_path(&self) -> std::path::PathBuf {
        std::path::Path::new(self.entity_type.as_str()).join(format!("{}.json", self.id.as_str()))
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// A single lowercase, hyphen-delimited path segment: `[a-z0-9]+(-[a-z0-9]+)*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validation::validate_slug(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Slug {
    type Error = crate::error::StoreError;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Slug> for String {
    fn from(value: Slug) -> Self {
        value.0
    }
}

/// A validated materialized path, e.g. `/us/ca/sf`. The root path is `"/"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaterializedPath(String);

/// Default bound used when a caller validates a path without a store-level
/// `maxDepth` in hand (e.g. constructing one before a store is open).
pub const DEFAULT_MAX_DEPTH: usize = 32;

impl MaterializedPath {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        Self::with_max_depth(value, DEFAULT_MAX_DEPTH)
    }

    pub fn with_max_depth(value: impl Into<String>, max_depth: usize) -> Result<Self> {
        let value = value.into();
        validation::validate_materialized_path(&value, max_depth)?;
        Ok(Self(value))
    }

    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn segments(&self) -> Vec<&str> {
        if self.is_root() {
            Vec::new()
        } else {
            self.0[1..].split('/').collect()
        }
    }

    /// The parent materialized path, or `None` if this is already the root.
    pub fn parent(&self) -> Option<MaterializedPath> {
        let segments = self.segments();
        if segments.is_empty() {
            return None;
        }
        let parent_segments = &segments[..segments.len() - 1];
        if parent_segments.is_empty() {
            Some(MaterializedPath::root())
        } else {
            Some(MaterializedPath(format!("/{}", parent_segments.join("/"))))
        }
    }

    /// Appends a child segment, returning the child's materialized path.
    pub fn child(&self, segment: &Slug) -> MaterializedPath {
        if self.is_root() {
            MaterializedPath(format!("/{segment}"))
        } else {
            MaterializedPath(format!("{}/{}", self.0, segment))
        }
    }
}

impl fmt::Display for MaterializedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MaterializedPath {
    type Error = crate::error::StoreError;
    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MaterializedPath> for String {
    fn from(value: MaterializedPath) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dockey_relative_path() {
        let key = DocKey::new("users", "alice").unwrap();
        assert_eq!(key.relative_path(), std::path::Path::new("users/alice.json"));
    }

    #[test]
    fn dockey_rejects_bad_components() {
        assert!(DocKey::new("../etc", "alice").is_err());
        assert!(DocKey::new("users", "CON").is_err());
    }

    #[test]
    fn materialized_path_parent_and_child() {
        let root = MaterializedPath::root();
        let us = root.child(&Slug::new("us").unwrap());
        assert_eq!(us.as_str(), "/us");
        let ca = us.child(&Slug::new("ca").unwrap());
        assert_eq!(ca.as_str(), "/us/ca");
        assert_eq!(ca.parent().unwrap().as_str(), "/us");
        assert_eq!(us.parent().unwrap().as_str(), "/");
        assert!(root.parent().is_none());
    }

    #[test]
    fn materialized_path_rejects_depth_overflow() {
        assert!(MaterializedPath::with_max_depth("/a/b/c", 2).is_err());
    }
}
