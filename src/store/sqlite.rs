//! SQLite store
//!
//! One `entities` table keyed by path, JSON-encoded attribute maps and
//! an optional content blob. A single-row `sequence` table hands out
//! creation order.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{EntityKind, Row, Store};
use crate::error::{RegistryError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS entities (
    key TEXT PRIMARY KEY,
    parent TEXT,
    collection TEXT NOT NULL,
    kind TEXT NOT NULL,
    id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    props TEXT NOT NULL,
    system TEXT NOT NULL,
    content BLOB
);
CREATE INDEX IF NOT EXISTS idx_entities_parent ON entities(parent, collection, seq);
CREATE TABLE IF NOT EXISTS sequence (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO sequence (id, value) VALUES (1, 0);
";

pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let db = Connection::open(path)?;
        db.execute_batch("PRAGMA journal_mode=WAL;")?;
        db.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "SQLite store opened");
        Ok(Self { db })
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self { db })
    }

    fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
        Ok(RawRow {
            key: row.get(0)?,
            parent: row.get(1)?,
            collection: row.get(2)?,
            kind: row.get(3)?,
            id: row.get(4)?,
            seq: row.get(5)?,
            props: row.get(6)?,
            system: row.get(7)?,
            content: row.get(8)?,
        })
    }
}

/// Column values before JSON decoding
struct RawRow {
    key: String,
    parent: Option<String>,
    collection: String,
    kind: String,
    id: String,
    seq: i64,
    props: String,
    system: String,
    content: Option<Vec<u8>>,
}

impl RawRow {
    fn decode(self) -> Result<Row> {
        let kind = EntityKind::parse(&self.kind).ok_or_else(|| {
            RegistryError::bad_request(format!("Unknown entity kind \"{}\" at {}", self.kind, self.key))
        })?;
        Ok(Row {
            key: self.key,
            parent: self.parent,
            collection: self.collection,
            kind,
            id: self.id,
            seq: self.seq as u64,
            props: serde_json::from_str::<Map<String, Value>>(&self.props)?,
            system: serde_json::from_str::<Map<String, Value>>(&self.system)?,
            content: self.content,
        })
    }
}

const COLUMNS: &str = "key, parent, collection, kind, id, seq, props, system, content";

impl Store for SqliteStore {
    fn begin(&mut self) -> Result<()> {
        self.db.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.db.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.db.is_autocommit() {
            self.db.execute_batch("ROLLBACK")?;
            debug!("SQLite transaction rolled back");
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Row>> {
        let mut stmt = self
            .db
            .prepare_cached(&format!("SELECT {} FROM entities WHERE key = ?1", COLUMNS))?;
        let raw = stmt.query_row([key], Self::read_row).optional()?;
        raw.map(RawRow::decode).transpose()
    }

    fn put(&mut self, row: &Row) -> Result<()> {
        let props = serde_json::to_string(&row.props)?;
        let system = serde_json::to_string(&row.system)?;
        self.db.execute(
            "INSERT INTO entities (key, parent, collection, kind, id, seq, props, system, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(key) DO UPDATE SET parent = ?2, collection = ?3, kind = ?4, id = ?5,
                 seq = ?6, props = ?7, system = ?8, content = ?9",
            params![
                row.key,
                row.parent,
                row.collection,
                row.kind.as_str(),
                row.id,
                row.seq as i64,
                props,
                system,
                row.content
            ],
        )?;
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.db.execute(
            "DELETE FROM entities WHERE key = ?1 OR substr(key, 1, length(?2)) = ?2",
            params![key, prefix],
        )?;
        Ok(())
    }

    fn children(&self, parent: &str, collection: &str) -> Result<Vec<Row>> {
        let mut stmt = self.db.prepare_cached(&format!(
            "SELECT {} FROM entities WHERE parent = ?1 AND collection = ?2 ORDER BY seq",
            COLUMNS
        ))?;
        let raws = stmt
            .query_map(params![parent, collection], Self::read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawRow::decode).collect()
    }

    fn next_seq(&mut self) -> Result<u64> {
        self.db
            .execute("UPDATE sequence SET value = value + 1 WHERE id = 1", [])?;
        let value: i64 = self
            .db
            .query_row("SELECT value FROM sequence WHERE id = 1", [], |row| row.get(0))?;
        Ok(value as u64)
    }
}
