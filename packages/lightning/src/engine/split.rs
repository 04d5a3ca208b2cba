use super::query::IncludeSpec;
use super::schema::RelationMap;
use super::types::{union_rows, DbValue, Row, TableRows};
use smol_str::SmolStr;

/// Flatten a nested result into `table -> rows`, removing include fields from their
/// parents. The root table is always present; include tables only when non-empty.
/// Rows are unique by id per table.
pub fn split_result(
    table: &str,
    rows: Vec<Row>,
    include: &IncludeSpec,
    relations: &RelationMap,
) -> TableRows {
    let mut out = TableRows::default();
    out.insert(SmolStr::new(table), Vec::with_capacity(rows.len()));
    split_into(&mut out, table, rows, include, relations);
    out
}

fn split_into(
    out: &mut TableRows,
    table: &str,
    rows: Vec<Row>,
    include: &IncludeSpec,
    relations: &RelationMap,
) {
    if rows.is_empty() {
        return;
    }
    out.entry(SmolStr::new(table)).or_default();

    let mut parents = Vec::with_capacity(rows.len());
    for mut row in rows {
        for (name, spec) in include {
            let Some(value) = row.shift_remove(name.as_str()) else {
                continue;
            };
            let children: Vec<Row> = match value {
                DbValue::Array(items) => items
                    .into_iter()
                    .filter_map(|item| match item {
                        DbValue::Object(obj) => Some(obj),
                        _ => None,
                    })
                    .collect(),
                DbValue::Object(obj) => vec![obj],
                _ => Vec::new(),
            };
            if children.is_empty() {
                continue;
            }

            let target = relations
                .get(table)
                .and_then(|rels| rels.get(name))
                .map(|rel| rel.target.clone())
                .unwrap_or_else(|| name.clone());
            let nested = spec
                .params()
                .map(|p| p.include.clone())
                .unwrap_or_default();
            split_into(out, &target, children, &nested, relations);
        }
        parents.push(row);
    }
    if let Some(existing) = out.get_mut(table) {
        union_rows(existing, parents);
    }
}
