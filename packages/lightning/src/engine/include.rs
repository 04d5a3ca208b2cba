//! Row shaping and include resolution.
//!
//! Both the in-memory store and the client cache derive results the same way:
//! filter with `where`, one stable sort pass per `orderBy` entry (so the last entry
//! is the primary key), then `skip` and `take`, then nested includes per row.

use super::eval::{compare_values, filter_rows, related_rows, EvalContext, EvalError, Related};
use super::query::{Include, IncludeSpec, QueryParams, SortOrder};
use super::types::{DbValue, Row};

/// Filter, order and slice `candidates` of `table`.
pub fn query_rows<'r>(
    table: &str,
    candidates: Vec<&'r Row>,
    params: &QueryParams,
    ctx: &EvalContext<'_>,
) -> Result<Vec<&'r Row>, EvalError> {
    let mut rows = filter_rows(params.r#where.as_ref(), table, candidates, ctx)?;
    order_rows(&mut rows, params);
    Ok(slice_rows(rows, params))
}

pub fn order_rows(rows: &mut [&Row], params: &QueryParams) {
    for (field, order) in &params.order_by.0 {
        rows.sort_by(|a, b| {
            let cmp = compare_values(a.get(field.as_str()), b.get(field.as_str()));
            match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            }
        });
    }
}

pub fn slice_rows<'r>(rows: Vec<&'r Row>, params: &QueryParams) -> Vec<&'r Row> {
    let skip = params.skip.unwrap_or(0);
    let take = params.take.unwrap_or(usize::MAX);
    rows.into_iter().skip(skip).take(take).collect()
}

/// `query_rows`, then clone each row and resolve `params.include` into it.
pub fn materialize(
    table: &str,
    candidates: Vec<&Row>,
    params: &QueryParams,
    ctx: &EvalContext<'_>,
) -> Result<Vec<Row>, EvalError> {
    let rows = query_rows(table, candidates, params, ctx)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut row = row.clone();
        resolve_includes(&mut row, &params.include, table, ctx)?;
        out.push(row);
    }
    Ok(out)
}

/// Attach one field per enabled include key. `manyToOne` yields the related record or
/// `null`, `oneToMany` always an array. Related rows the lookup cannot see resolve as
/// missing.
pub fn resolve_includes(
    row: &mut Row,
    include: &IncludeSpec,
    table: &str,
    ctx: &EvalContext<'_>,
) -> Result<(), EvalError> {
    for (name, spec) in include {
        if !spec.is_enabled() {
            continue;
        }
        let relation = ctx.relation(table, name)?;
        let candidates = match related_rows(ctx.lookup, relation, row) {
            Related::Rows(rows) => rows,
            Related::Unknown => Vec::new(),
        };

        let resolved = match spec {
            Include::Flag(_) => candidates.into_iter().cloned().collect::<Vec<_>>(),
            Include::Nested(params) => materialize(&relation.target, candidates, params, ctx)?,
        };

        let value = if relation.is_many() {
            DbValue::Array(resolved.into_iter().map(DbValue::Object).collect())
        } else {
            resolved
                .into_iter()
                .next()
                .map(DbValue::Object)
                .unwrap_or(DbValue::Null)
        };
        row.insert(name.clone(), value);
    }
    Ok(())
}
