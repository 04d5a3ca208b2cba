//! Normalized client cache: `table -> rows`, unique by id, in insertion order.

use indexmap::IndexMap;
use lightning::engine::types::{merge_row, row_key, FastSet};
use lightning::{FastMap, RelatedRowsLookup, Row, RowKey, TableRows};
use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheTable {
    rows: Vec<Row>,
    index: FastMap<RowKey, usize>,
}

impl CacheTable {
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn position(&self, key: &RowKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.position(key).map(|pos| &self.rows[pos])
    }

    /// Shallow-merge into the row with the same id, or append.
    pub fn upsert(&mut self, row: Row) {
        let Some(key) = row_key(&row) else {
            tracing::warn!("Dropping cache row without id");
            return;
        };
        match self.index.get(&key) {
            Some(&pos) => merge_row(&mut self.rows[pos], &row),
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(row);
            }
        }
    }

    /// Merge `patch` into the row at `pos`. When the patch moves the row onto an id
    /// another row already holds, the patched row is merged into that row and removed.
    pub fn patch_at(&mut self, pos: usize, patch: &Row) {
        let old_key = row_key(&self.rows[pos]);
        merge_row(&mut self.rows[pos], patch);
        let new_key = row_key(&self.rows[pos]);
        if new_key == old_key {
            return;
        }
        let taken = new_key
            .as_ref()
            .and_then(|key| self.index.get(key).copied())
            .filter(|&other| other != pos);
        if let Some(other) = taken {
            let patched = self.rows.remove(pos);
            let target = if other > pos { other - 1 } else { other };
            merge_row(&mut self.rows[target], &patched);
        }
        self.reindex();
    }

    /// Patch every row at `positions`. Highest positions go first so a row collapsed
    /// by [`patch_at`](Self::patch_at) never shifts one still to be patched.
    pub fn patch_all(&mut self, positions: &[usize], patch: &Row) {
        let mut positions = positions.to_vec();
        positions.sort_unstable_by(|a, b| b.cmp(a));
        positions.dedup();
        for pos in positions {
            self.patch_at(pos, patch);
        }
    }

    /// Remove rows whose id is in `keys`. Returns how many were removed.
    pub fn remove(&mut self, keys: &FastSet<RowKey>) -> usize {
        let before = self.rows.len();
        self.rows
            .retain(|row| row_key(row).map_or(true, |k| !keys.contains(&k)));
        let removed = before - self.rows.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.index.clear();
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, row) in self.rows.iter().enumerate() {
            if let Some(key) = row_key(row) {
                self.index.insert(key, pos);
            }
        }
    }
}

pub type Snapshot = IndexMap<SmolStr, CacheTable, BuildHasherDefault<FxHasher>>;

#[derive(Debug, Clone, Default)]
pub struct Cache {
    tables: Snapshot,
    version: u64,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every write; derived views are memoized against it.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn table(&self, name: &str) -> Option<&CacheTable> {
        self.tables.get(name)
    }

    pub fn rows(&self, name: &str) -> &[Row] {
        self.table(name).map(CacheTable::rows).unwrap_or(&[])
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_mut(&mut self, name: &str) -> &mut CacheTable {
        self.version += 1;
        self.tables.entry(SmolStr::new(name)).or_default()
    }

    /// Merge server rows by id and drop deleted ids.
    pub fn apply_authoritative(&mut self, data: TableRows, deletes: &IndexMap<SmolStr, FastSet<RowKey>>) {
        for (table, rows) in data {
            let target = self.table_mut(&table);
            for row in rows {
                target.upsert(row);
            }
        }
        self.remove_ids(deletes);
    }

    pub fn remove_ids(&mut self, deletes: &IndexMap<SmolStr, FastSet<RowKey>>) {
        for (table, keys) in deletes {
            if let Some(target) = self.tables.get_mut(table) {
                if target.remove(keys) > 0 {
                    self.version += 1;
                }
            }
        }
    }

    /// Deep copy of every table.
    pub fn snapshot(&self) -> Snapshot {
        self.tables.clone()
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.tables = snapshot;
        self.version += 1;
    }

    pub fn tables(&self) -> &Snapshot {
        &self.tables
    }
}

impl RelatedRowsLookup for Cache {
    fn table_rows(&self, table: &str) -> Option<&[Row]> {
        Some(self.rows(table))
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use lightning::engine::types::{id_key, row_from_json, row_to_json};
    use lightning::DbValue;
    use serde_json::{json, Value};

    fn data(v: Value) -> TableRows {
        let mut out = TableRows::default();
        if let Value::Object(map) = v {
            for (table, rows) in map {
                let rows = rows.as_array().cloned().unwrap_or_default();
                out.insert(table.into(), rows.into_iter().map(row_from_json).collect());
            }
        }
        out
    }

    fn deletes(table: &str, ids: &[i64]) -> IndexMap<SmolStr, FastSet<RowKey>> {
        let mut out = IndexMap::new();
        out.insert(
            SmolStr::new(table),
            ids.iter().map(|id| id_key(&DbValue::from(*id))).collect(),
        );
        out
    }

    fn json_rows(cache: &Cache, table: &str) -> Vec<Value> {
        cache.rows(table).iter().map(row_to_json).collect()
    }

    #[test]
    fn test_merge_is_shallow_and_appends_new_rows() {
        let mut cache = Cache::new();
        cache.apply_authoritative(data(json!({"users": [{"id": 1, "name": "A", "age": 3}]})), &IndexMap::new());
        cache.apply_authoritative(
            data(json!({"users": [{"id": 1, "name": "B"}, {"id": 2, "name": "C"}]})),
            &IndexMap::new(),
        );
        assert_eq!(
            json_rows(&cache, "users"),
            vec![json!({"id": 1, "name": "B", "age": 3}), json!({"id": 2, "name": "C"})]
        );
    }

    #[test]
    fn test_authoritative_patch_is_idempotent() {
        let patch = data(json!({"posts": [{"id": 4, "title": "x"}]}));
        let mut once = Cache::new();
        once.apply_authoritative(patch.clone(), &deletes("posts", &[9]));
        let mut twice = once.clone();
        twice.apply_authoritative(patch, &deletes("posts", &[9]));
        assert_eq!(once.tables(), twice.tables());
    }

    #[test]
    fn test_deletes_remove_rows() {
        let mut cache = Cache::new();
        cache.apply_authoritative(data(json!({"posts": [{"id": 1}, {"id": 2}, {"id": 3}]})), &IndexMap::new());
        let version = cache.version();
        cache.remove_ids(&deletes("posts", &[2, 7]));
        assert_eq!(json_rows(&cache, "posts"), vec![json!({"id": 1}), json!({"id": 3})]);
        assert!(cache.version() > version);
        assert_eq!(cache.table("posts").unwrap().position(&id_key(&DbValue::from(3i64))), Some(1));
    }

    #[test]
    fn test_patch_onto_taken_id_merges_rows() {
        let mut cache = Cache::new();
        cache.apply_authoritative(
            data(json!({"users": [
                {"id": 1, "name": "A", "age": 3},
                {"id": 2, "name": "B"},
                {"id": 3, "name": "C"}
            ]})),
            &IndexMap::new(),
        );

        let table = cache.table_mut("users");
        table.patch_at(2, &row_from_json(json!({"id": 1, "name": "Moved"})));
        assert_eq!(
            table.rows().iter().map(row_to_json).collect::<Vec<_>>(),
            vec![json!({"id": 1, "name": "Moved", "age": 3}), json!({"id": 2, "name": "B"})]
        );
        assert_eq!(table.position(&id_key(&DbValue::from(2i64))), Some(1));

        // Onto a later row.
        table.patch_at(0, &row_from_json(json!({"id": 2})));
        assert_eq!(
            table.rows().iter().map(row_to_json).collect::<Vec<_>>(),
            vec![json!({"id": 2, "name": "Moved", "age": 3})]
        );
        assert_eq!(table.position(&id_key(&DbValue::from(2i64))), Some(0));
    }

    #[test]
    fn test_patch_all_to_one_id_leaves_single_row() {
        let mut cache = Cache::new();
        cache.apply_authoritative(
            data(json!({"posts": [{"id": 1, "a": 1}, {"id": 2, "b": 2}, {"id": 3, "c": 3}]})),
            &IndexMap::new(),
        );
        let table = cache.table_mut("posts");
        table.patch_all(&[0, 1, 2], &row_from_json(json!({"id": 9})));
        assert_eq!(table.len(), 1);
        assert_eq!(table.rows()[0]["id"], DbValue::from(9i64));
        assert_eq!(table.position(&id_key(&DbValue::from(9i64))), Some(0));
    }

    #[test]
    fn test_restore_brings_back_snapshot() {
        let mut cache = Cache::new();
        cache.apply_authoritative(data(json!({"posts": [{"id": 1}]})), &IndexMap::new());
        let snapshot = cache.snapshot();
        cache.table_mut("posts").upsert(row_from_json(json!({"id": -1})));
        cache.restore(snapshot.clone());
        assert_eq!(cache.tables(), &snapshot);
    }
}
