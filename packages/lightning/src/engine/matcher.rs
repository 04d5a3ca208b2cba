//! Decides which stored queries a batch of changes may affect.
//!
//! A change matches a where when its old values or its new values satisfy it. Old
//! values from the log usually carry only key columns, so predicates on absent columns
//! count as satisfied; relation filters are never answerable from a log row and also
//! count as satisfied. Both over-match; neither misses an update.

use super::eval::{matches, EvalContext};
use super::query::Where;
use super::schema::RelationMap;
use super::subscription::StoredQuery;
use super::types::{ChangeOp, GroupedChanges, Row};

pub fn change_matches(filter: &Where, table: &str, change: &ChangeOp, relations: &RelationMap) -> bool {
    let check = |row: &Row, partial: bool| {
        let ctx = EvalContext::for_change(relations, partial);
        matches(filter, table, row, &ctx).unwrap_or_else(|e| {
            tracing::debug!(table, error = %e, "Treating unevaluable change as a match");
            true
        })
    };

    match change {
        ChangeOp::Insert { columns } => check(columns, false),
        ChangeOp::Update { columns, old_keys } => check(old_keys, true) || check(columns, false),
        ChangeOp::Delete { old_keys } => check(old_keys, true),
    }
}

fn any_change_matches(filter: Option<&Where>, table: &str, changes: &[ChangeOp], relations: &RelationMap) -> bool {
    match filter {
        None => true,
        Some(w) => changes.iter().any(|c| change_matches(w, table, c, relations)),
    }
}

/// Is `query` dirty for this batch? The main table is checked first, then each
/// derived include.
pub fn is_dirty(query: &StoredQuery, changes: &GroupedChanges, relations: &RelationMap) -> bool {
    if let Some(table_changes) = changes.get(query.table.as_str()) {
        if any_change_matches(query.params.filter(), &query.table, table_changes, relations) {
            return true;
        }
    }

    query.derived.iter().any(|include| {
        changes
            .get(include.table.as_str())
            .is_some_and(|table_changes| {
                any_change_matches(include.params.filter(), &include.table, table_changes, relations)
            })
    })
}
