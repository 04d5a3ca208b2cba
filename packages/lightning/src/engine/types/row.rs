use super::{DbValue, FastMap, FieldMap};
use indexmap::IndexMap;
use rustc_hash::FxHasher;
use serde_json::Value;
use smol_str::SmolStr;
use std::hash::BuildHasherDefault;

/// A single record: column name -> value, always carrying `id`.
pub type Row = FieldMap;

/// Hashable identity of a row id, distinguishing `1` from `"1"`.
pub type RowKey = SmolStr;

/// `table -> rows`, ordered by first appearance of the table.
pub type TableRows = IndexMap<SmolStr, Vec<Row>, BuildHasherDefault<FxHasher>>;

pub const ID: &str = "id";

#[inline]
pub fn row_id(row: &Row) -> Option<&DbValue> {
    row.get(ID).filter(|v| !v.is_null())
}

/// Canonical key for an id value. Numeric ids are keyed through `f64` and are
/// distinct only up to 2^53 - 1.
#[inline]
pub fn id_key(id: &DbValue) -> RowKey {
    match id {
        DbValue::Str(s) => SmolStr::new(format!("\"{}\"", s)),
        DbValue::Number(n) if n.fract() == 0.0 => SmolStr::new(format!("{}", *n as i64)),
        other => SmolStr::new(Value::from(other.clone()).to_string()),
    }
}

#[inline]
pub fn row_key(row: &Row) -> Option<RowKey> {
    row_id(row).map(id_key)
}

/// Build a row from a JSON object. Non-objects yield an empty row.
pub fn row_from_json(value: Value) -> Row {
    match DbValue::from(value) {
        DbValue::Object(map) => map,
        _ => Row::default(),
    }
}

pub fn row_to_json(row: &Row) -> Value {
    Value::from(DbValue::Object(row.clone()))
}

/// Shallow field merge: every column of `incoming` overwrites the column in `target`.
pub fn merge_row(target: &mut Row, incoming: &Row) {
    for (k, v) in incoming {
        target.insert(k.clone(), v.clone());
    }
}

/// Union `rows` into `into`, deduplicating by id. Later rows replace earlier ones
/// in place so the first-seen position is kept.
pub fn union_rows(into: &mut Vec<Row>, rows: impl IntoIterator<Item = Row>) {
    let mut positions: FastMap<RowKey, usize> = into
        .iter()
        .enumerate()
        .filter_map(|(i, r)| row_key(r).map(|k| (k, i)))
        .collect();

    for row in rows {
        match row_key(&row) {
            Some(key) => match positions.get(&key) {
                Some(&i) => into[i] = row,
                None => {
                    positions.insert(key, into.len());
                    into.push(row);
                }
            },
            None => into.push(row),
        }
    }
}

/// Merge `incoming` into `target` table by table.
pub fn union_table_rows(target: &mut TableRows, incoming: TableRows) {
    for (table, rows) in incoming {
        if rows.is_empty() {
            continue;
        }
        union_rows(target.entry(table).or_default(), rows);
    }
}
