//! Optimistic application of outgoing mutations.
//!
//! Creates get decrementing negative temp ids so they can be told apart from server
//! rows and dropped once the reply lands. Every other action locates rows by `id`
//! equality or, failing that, by evaluating its `where` against the cache.

use crate::cache::{Cache, Snapshot};
use crate::error::{ClientError, Result};
use lightning::engine::eval::filter_rows;
use lightning::engine::query::FieldFilter;
use lightning::engine::types::{id_key, row_key, FastSet, ID};
use lightning::{DbValue, EvalContext, MutationAction, MutationSet, RowKey, Schema, Where};
use smol_str::SmolStr;

/// Hands out `-1, -2, ...`.
#[derive(Debug, Clone)]
pub struct TempIds {
    next: i64,
}

impl Default for TempIds {
    fn default() -> Self {
        Self { next: -1 }
    }
}

impl TempIds {
    pub fn allocate(&mut self) -> DbValue {
        let id = self.next;
        self.next -= 1;
        DbValue::from(id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TempRow {
    pub model: SmolStr,
    pub id: DbValue,
}

/// An optimistic send waiting for its reply.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    pub query_id: u64,
    pub snapshot: Snapshot,
    pub temp_rows: Vec<TempRow>,
}

/// Apply `mutations` to `cache`, returning the temp rows created. On error the cache
/// may be partially modified; callers restore their snapshot.
pub fn apply_optimistic(
    cache: &mut Cache,
    schema: &Schema,
    mutations: &[MutationSet],
    temp_ids: &mut TempIds,
) -> Result<Vec<TempRow>> {
    let mut temp_rows = Vec::new();
    for set in mutations {
        for (model, action) in &set.ops {
            schema.model(model)?;
            apply_action(cache, schema, model, action, temp_ids, &mut temp_rows)?;
        }
    }
    Ok(temp_rows)
}

fn apply_action(
    cache: &mut Cache,
    schema: &Schema,
    model: &SmolStr,
    action: &MutationAction,
    temp_ids: &mut TempIds,
    temp_rows: &mut Vec<TempRow>,
) -> Result<()> {
    match action {
        MutationAction::Create { data } => {
            let mut row = data.clone();
            let id = temp_ids.allocate();
            row.insert(SmolStr::new(ID), id.clone());
            cache.table_mut(model).upsert(row);
            temp_rows.push(TempRow { model: model.clone(), id });
        }
        MutationAction::CreateMany { data } => {
            for item in data {
                let mut row = item.clone();
                let id = temp_ids.allocate();
                row.insert(SmolStr::new(ID), id.clone());
                cache.table_mut(model).upsert(row);
                temp_rows.push(TempRow { model: model.clone(), id });
            }
        }
        MutationAction::Update { r#where, data } => {
            if let Some(pos) = locate(cache, schema, model, r#where)?.first() {
                cache.table_mut(model).patch_at(*pos, data);
            }
        }
        MutationAction::UpdateMany { r#where, data, limit } => {
            let mut positions = match r#where {
                Some(w) => matching_positions(cache, schema, model, w)?,
                None => (0..cache.rows(model).len()).collect(),
            };
            if let Some(limit) = limit {
                positions.truncate(*limit);
            }
            cache.table_mut(model).patch_all(&positions, data);
        }
        MutationAction::Upsert { r#where, create, update } => {
            match locate(cache, schema, model, r#where)?.first() {
                Some(pos) => cache.table_mut(model).patch_at(*pos, update),
                None => {
                    let id = match r#where.get(ID) {
                        Some(FieldFilter::Equals(id)) => id.clone(),
                        _ => temp_ids.allocate(),
                    };
                    let mut row = create.clone();
                    row.insert(SmolStr::new(ID), id.clone());
                    cache.table_mut(model).upsert(row);
                    temp_rows.push(TempRow { model: model.clone(), id });
                }
            }
        }
        MutationAction::Delete { r#where } => {
            if let Some(&pos) = locate(cache, schema, model, r#where)?.first() {
                let keys = keys_at(cache, model, &[pos]);
                cache.table_mut(model).remove(&keys);
            }
        }
        MutationAction::DeleteMany { r#where, limit } => match r#where {
            None if limit.is_none() => cache.table_mut(model).clear(),
            _ => {
                let mut positions = match r#where {
                    Some(w) => matching_positions(cache, schema, model, w)?,
                    None => (0..cache.rows(model).len()).collect(),
                };
                if let Some(limit) = limit {
                    positions.truncate(*limit);
                }
                let keys = keys_at(cache, model, &positions);
                cache.table_mut(model).remove(&keys);
            }
        },
    }
    Ok(())
}

/// Position of the row a single-row action targets: by id when the where names one,
/// else the first row matching it.
fn locate(cache: &Cache, schema: &Schema, model: &str, filter: &Where) -> Result<Vec<usize>> {
    if let Some(FieldFilter::Equals(id)) = filter.get(ID) {
        let pos = cache.table(model).and_then(|t| t.position(&id_key(id)));
        return Ok(pos.into_iter().collect());
    }
    let mut positions = matching_positions(cache, schema, model, filter)?;
    positions.truncate(1);
    Ok(positions)
}

fn matching_positions(cache: &Cache, schema: &Schema, model: &str, filter: &Where) -> Result<Vec<usize>> {
    let rows = cache.rows(model);
    let ctx = EvalContext::new(schema.relations(), cache);
    let matched = filter_rows(Some(filter), model, rows.iter().collect(), &ctx).map_err(ClientError::from)?;
    let table = match cache.table(model) {
        Some(table) => table,
        None => return Ok(Vec::new()),
    };
    Ok(matched
        .into_iter()
        .filter_map(row_key)
        .filter_map(|key| table.position(&key))
        .collect())
}

fn keys_at(cache: &Cache, model: &str, positions: &[usize]) -> FastSet<RowKey> {
    let rows = cache.rows(model);
    positions
        .iter()
        .filter_map(|&pos| rows.get(pos).and_then(row_key))
        .collect()
}
