//! Persistence
//!
//! The registry keeps every entity as a [`Row`] addressed by its path
//! key. Stores only need flat key/value access plus ordered child
//! listing; the entity tree semantics live in `registry`.
//!
//! Every registry call runs inside exactly one `begin`/`commit` (or
//! `rollback`) pair.

pub mod memory;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Registry,
    Group,
    Resource,
    Meta,
    Version,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Registry => "registry",
            EntityKind::Group => "group",
            EntityKind::Resource => "resource",
            EntityKind::Meta => "meta",
            EntityKind::Version => "version",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registry" => Some(EntityKind::Registry),
            "group" => Some(EntityKind::Group),
            "resource" => Some(EntityKind::Resource),
            "meta" => Some(EntityKind::Meta),
            "version" => Some(EntityKind::Version),
            _ => None,
        }
    }
}

/// One stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Path key, e.g. `/dirs/d1/files/f1/versions/v1`
    pub key: String,
    /// Parent entity key (`/` for groups, the Resource for meta/versions)
    pub parent: Option<String>,
    /// Collection plural within the parent (`versions` for versions)
    pub collection: String,
    pub kind: EntityKind,
    pub id: String,
    /// Creation order within the store
    pub seq: u64,
    /// Attributes as the client sees them, including epoch and timestamps
    pub props: Map<String, Value>,
    /// Server bookkeeping that is never rendered
    pub system: Map<String, Value>,
    pub content: Option<Vec<u8>>,
}

impl Row {
    pub fn new(
        key: impl Into<String>,
        parent: Option<String>,
        collection: impl Into<String>,
        kind: EntityKind,
        id: impl Into<String>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            parent,
            collection: collection.into(),
            kind,
            id: id.into(),
            seq,
            props: Map::new(),
            system: Map::new(),
            content: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.props.get("epoch").and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn prop_str(&self, name: &str) -> Option<&str> {
        self.props.get(name).and_then(Value::as_str)
    }

    pub fn system_str(&self, name: &str) -> Option<&str> {
        self.system.get(name).and_then(Value::as_str)
    }
}

/// Persistence collaborator
pub trait Store: Send {
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Row>>;
    /// Insert or replace by key
    fn put(&mut self, row: &Row) -> Result<()>;
    /// Remove the row and every descendant (`key/...`)
    fn delete(&mut self, key: &str) -> Result<()>;
    /// Children of `parent` in `collection`, in creation order
    fn children(&self, parent: &str, collection: &str) -> Result<Vec<Row>>;
    /// Next creation sequence number
    fn next_seq(&mut self) -> Result<u64>;
}

/// Descendant test shared by the store implementations
pub(crate) fn is_within(key: &str, root: &str) -> bool {
    key == root || (key.starts_with(root) && key[root.len()..].starts_with('/'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Behavior every store must share
    pub fn exercise(store: &mut dyn Store) {
        store.begin().unwrap();
        let mut group = Row::new("/dirs/d1", Some("/".into()), "dirs", EntityKind::Group, "d1", store.next_seq().unwrap());
        group.props.insert("epoch".into(), json!(1));
        store.put(&group).unwrap();
        for id in ["f2", "f1", "f3"] {
            let seq = store.next_seq().unwrap();
            let row = Row::new(format!("/dirs/d1/files/{}", id), Some("/dirs/d1".into()), "files", EntityKind::Resource, id, seq);
            store.put(&row).unwrap();
        }
        let mut version = Row::new("/dirs/d1/files/f1/versions/1", Some("/dirs/d1/files/f1".into()), "versions", EntityKind::Version, "1", store.next_seq().unwrap());
        version.content = Some(b"hello".to_vec());
        store.put(&version).unwrap();
        store.commit().unwrap();

        let ids: Vec<String> = store.children("/dirs/d1", "files").unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["f2", "f1", "f3"]);
        assert_eq!(store.get("/dirs/d1").unwrap().unwrap().epoch(), 1);
        assert_eq!(store.get("/dirs/d1/files/f1/versions/1").unwrap().unwrap().content, Some(b"hello".to_vec()));

        // Rollback discards everything since begin
        store.begin().unwrap();
        store.delete("/dirs/d1/files/f1").unwrap();
        assert!(store.get("/dirs/d1/files/f1/versions/1").unwrap().is_none());
        store.rollback().unwrap();
        assert!(store.get("/dirs/d1/files/f1/versions/1").unwrap().is_some());

        // Delete is prefix-aware: f1 must not take f10 with it
        store.begin().unwrap();
        let seq = store.next_seq().unwrap();
        store.put(&Row::new("/dirs/d1/files/f10", Some("/dirs/d1".into()), "files", EntityKind::Resource, "f10", seq)).unwrap();
        store.delete("/dirs/d1/files/f1").unwrap();
        store.commit().unwrap();
        assert!(store.get("/dirs/d1/files/f10").unwrap().is_some());
        assert!(store.get("/dirs/d1/files/f1/versions/1").unwrap().is_none());
        assert_eq!(store.children("/dirs/d1", "files").unwrap().len(), 3);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
    }
}
