//! Re-execution of dirty queries and the per-connection patch.
//!
//! Every dirty query re-runs under the connection identity. Results are split per
//! table and unioned by id across queries. A changed row that no longer shows up in
//! any recomputed result is reported as deleted, but only for tables some dirty query
//! can put on the client.

use super::matcher::is_dirty;
use super::schema::Schema;
use super::subscription::{QueryList, StoredQuery};
use super::types::{id_key, row_id, union_table_rows, ChangeOp, DbValue, FastSet, GroupedChanges, RowKey, TableRows};
use crate::error::Result;
use crate::service;
use crate::store::{DataStore, Identity};
use futures::future::try_join_all;
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;
use tracing::{debug, instrument};

/// `table -> ids` removed from the client's view.
pub type DeletedIds = IndexMap<SmolStr, Vec<DbValue>, BuildHasherDefault<FxHasher>>;

/// What a connection is sent after a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub data: TableRows,
    pub deletes: DeletedIds,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.data.values().all(Vec::is_empty) && self.deletes.values().all(Vec::is_empty)
    }

    /// Drop tables without rows.
    fn compact(mut self) -> Self {
        self.data.retain(|_, rows| !rows.is_empty());
        self.deletes.retain(|_, ids| !ids.is_empty());
        self
    }
}

#[derive(Debug, Default)]
pub struct RecomputeOutcome {
    /// `None` when nothing is dirty or nothing changed for the client.
    pub patch: Option<Patch>,
    /// Re-executed queries with fresh derived includes, to write back into the list.
    pub refreshed: Vec<StoredQuery>,
    pub recomputed: usize,
}

#[instrument(skip_all, fields(queries = queries.len(), tables = changes.len()))]
pub async fn recompute(
    store: &dyn DataStore,
    identity: &Identity,
    schema: &Schema,
    queries: &QueryList,
    changes: &GroupedChanges,
) -> Result<RecomputeOutcome> {
    let dirty: Vec<_> = queries
        .iter()
        .filter(|q| is_dirty(q, changes, schema.relations()))
        .collect();
    if dirty.is_empty() {
        return Ok(RecomputeOutcome::default());
    }

    let results = try_join_all(dirty.iter().map(|q| {
        service::query::execute(store, identity, schema, q.slot, &q.table, q.params.clone())
    }))
    .await?;

    let mut data = TableRows::default();
    let mut covered: FastSet<SmolStr> = FastSet::default();
    let mut refreshed = Vec::with_capacity(results.len());
    for (stored, rows) in results {
        covered.extend(stored.tables().cloned());
        union_table_rows(&mut data, rows);
        refreshed.push(stored);
    }
    // Derived includes from before the re-execution may reference tables the new
    // ones no longer do; rows of those tables can still be on the client.
    for q in &dirty {
        covered.extend(q.tables().cloned());
    }

    let deletes = removed_ids(changes, &covered, &data);
    let patch = Patch { data, deletes }.compact();
    let recomputed = refreshed.len();
    debug!(recomputed, empty = patch.is_empty(), "Recomputed dirty queries");

    Ok(RecomputeOutcome {
        patch: (!patch.is_empty()).then_some(patch),
        refreshed,
        recomputed,
    })
}

/// Ids touched by `changes` on covered tables that the fresh `data` no longer holds.
pub fn removed_ids(changes: &GroupedChanges, covered: &FastSet<SmolStr>, data: &TableRows) -> DeletedIds {
    let mut out = DeletedIds::default();
    for (table, ops) in changes {
        if !covered.contains(table) {
            continue;
        }
        let present: FastSet<RowKey> = data
            .get(table)
            .map(|rows| rows.iter().filter_map(|r| row_id(r).map(id_key)).collect())
            .unwrap_or_default();

        let mut seen: FastSet<RowKey> = FastSet::default();
        let mut ids = Vec::new();
        for op in ops {
            for id in candidate_ids(op) {
                let key = id_key(id);
                if !present.contains(&key) && seen.insert(key) {
                    ids.push(id.clone());
                }
            }
        }
        if !ids.is_empty() {
            out.insert(table.clone(), ids);
        }
    }
    out
}

fn candidate_ids(op: &ChangeOp) -> Vec<&DbValue> {
    let new_id = op.new_row().and_then(row_id);
    let old_id = op.old_row().and_then(row_id);
    match (new_id, old_id) {
        (Some(new), Some(old)) if id_key(new) != id_key(old) => vec![new, old],
        (Some(id), _) | (None, Some(id)) => vec![id],
        (None, None) => Vec::new(),
    }
}

#[cfg(test)]
mod recompute_tests {
    use super::*;
    use crate::engine::types::row_from_json;
    use serde_json::json;

    fn table_rows(v: serde_json::Value) -> TableRows {
        serde_json::from_value::<IndexMap<SmolStr, Vec<serde_json::Value>>>(v)
            .unwrap()
            .into_iter()
            .map(|(t, rows)| (t, rows.into_iter().map(row_from_json).collect()))
            .collect()
    }

    fn covered(tables: &[&str]) -> FastSet<SmolStr> {
        tables.iter().map(|t| SmolStr::new(t)).collect()
    }

    #[test]
    fn test_removed_ids_skip_rows_still_present() {
        let mut changes = GroupedChanges::default();
        changes.insert(
            "posts".into(),
            vec![
                ChangeOp::Update {
                    columns: row_from_json(json!({"id": 1, "published": false})),
                    old_keys: row_from_json(json!({"id": 1})),
                },
                ChangeOp::Update {
                    columns: row_from_json(json!({"id": 2, "published": true})),
                    old_keys: row_from_json(json!({"id": 2})),
                },
                ChangeOp::Delete {
                    old_keys: row_from_json(json!({"id": 3})),
                },
            ],
        );
        let data = table_rows(json!({"posts": [{"id": 2, "published": true}]}));
        let deletes = removed_ids(&changes, &covered(&["posts"]), &data);
        assert_eq!(deletes["posts"], vec![DbValue::from(1i64), DbValue::from(3i64)]);
    }

    #[test]
    fn test_uncovered_tables_report_nothing() {
        let mut changes = GroupedChanges::default();
        changes.insert(
            "comments".into(),
            vec![ChangeOp::Delete {
                old_keys: row_from_json(json!({"id": 3})),
            }],
        );
        assert!(removed_ids(&changes, &covered(&["posts"]), &TableRows::default()).is_empty());
    }

    #[test]
    fn test_id_change_reports_old_id() {
        let op = ChangeOp::Update {
            columns: row_from_json(json!({"id": 9})),
            old_keys: row_from_json(json!({"id": 4})),
        };
        let ids: Vec<_> = candidate_ids(&op).into_iter().cloned().collect();
        assert_eq!(ids, vec![DbValue::from(9i64), DbValue::from(4i64)]);
    }

    #[test]
    fn test_patch_with_only_empty_tables_is_empty() {
        let patch = Patch {
            data: table_rows(json!({"users": []})),
            deletes: DeletedIds::default(),
        }
        .compact();
        assert!(patch.is_empty());
        assert!(patch.data.is_empty());
    }
}
