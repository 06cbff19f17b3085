//! In-memory store
//!
//! A `BTreeMap` of rows. `begin` takes a snapshot that `rollback`
//! restores.

use std::collections::BTreeMap;

use super::{is_within, Row, Store};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: BTreeMap<String, Row>,
    seq: u64,
    snapshot: Option<(BTreeMap<String, Row>, u64)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Store for MemoryStore {
    fn begin(&mut self) -> Result<()> {
        self.snapshot = Some((self.rows.clone(), self.seq));
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some((rows, seq)) = self.snapshot.take() {
            self.rows = rows;
            self.seq = seq;
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Row>> {
        Ok(self.rows.get(key).cloned())
    }

    fn put(&mut self, row: &Row) -> Result<()> {
        self.rows.insert(row.key.clone(), row.clone());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<()> {
        self.rows.retain(|k, _| !is_within(k, key));
        Ok(())
    }

    fn children(&self, parent: &str, collection: &str) -> Result<Vec<Row>> {
        let mut rows: Vec<Row> = self
            .rows
            .values()
            .filter(|r| r.parent.as_deref() == Some(parent) && r.collection == collection)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.seq);
        Ok(rows)
    }

    fn next_seq(&mut self) -> Result<u64> {
        self.seq += 1;
        Ok(self.seq)
    }
}
