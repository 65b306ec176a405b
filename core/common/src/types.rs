//! Document model shared by the replication engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Revision history of a document, newest identifier first.
///
/// Mirrors the `_revisions` member CouchDB accepts with `new_edits=false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revisions {
    /// Generation number of the newest revision.
    pub start: u64,
    /// Short revision identifiers, newest first.
    pub ids: Vec<String>,
}

/// A logical document as seen by the local store.
///
/// The wire id is `<prefix><type>/<id>`; the prefix is a property of the
/// remote store, not of the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Document type (first segment of the wire id after the prefix).
    #[serde(rename = "type")]
    pub object_type: String,
    /// Document id within its type. Empty until assigned.
    #[serde(default)]
    pub id: String,
    /// Current revision string, `<start>-<hash>[-local]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Known revision history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revisions: Option<Revisions>,
    /// Whether the document is a deletion tombstone.
    #[serde(default)]
    pub deleted: bool,
    /// Whether the revision was produced for local use only.
    #[serde(default)]
    pub local_only: bool,
    /// User attributes.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl RemoteObject {
    /// Create an object with the given type and id and no attributes.
    pub fn new(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            rev: None,
            revisions: None,
            deleted: false,
            local_only: false,
            attributes: Map::new(),
        }
    }

    /// Set an attribute, builder style.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set the current revision, builder style.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Mark as a deletion tombstone, builder style.
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Mark as local-only, builder style.
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Whether an id has been assigned.
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    /// Merge attribute changes into this object.
    pub fn merge(&mut self, changes: &Map<String, Value>) {
        for (key, value) in changes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Get an attribute by name.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Classification of a change observed on the remote feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// First time the object is seen.
    Add,
    /// Object was seen before.
    Update,
    /// Object was deleted remotely.
    Remove,
}

impl ChangeKind {
    /// Event name used for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Remove => "remove",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
