use super::compare::{compare_operands, values_equal};
use super::{related_rows, EvalContext, EvalError, Related};
use crate::engine::query::{FieldFilter, Operator, QueryMode, RelationFilter, Where};
use crate::engine::schema::RelationKind;
use crate::engine::types::{DbValue, Row};
use std::cmp::Ordering;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "parallel")]
const PARALLEL_THRESHOLD: usize = 2048;

/// Does `row` of `table` satisfy every field predicate of `filter`?
pub fn matches(
    filter: &Where,
    table: &str,
    row: &Row,
    ctx: &EvalContext<'_>,
) -> Result<bool, EvalError> {
    for (field, predicate) in &filter.fields {
        if !field_matches(table, field, predicate, row, ctx)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Candidates of `table` that satisfy `filter`, in input order.
pub fn filter_rows<'r>(
    filter: Option<&Where>,
    table: &str,
    rows: Vec<&'r Row>,
    ctx: &EvalContext<'_>,
) -> Result<Vec<&'r Row>, EvalError> {
    let Some(filter) = filter.filter(|w| !w.is_empty()) else {
        return Ok(rows);
    };

    #[cfg(feature = "parallel")]
    if rows.len() >= PARALLEL_THRESHOLD {
        return rows
            .into_par_iter()
            .filter_map(|row| match matches(filter, table, row, ctx) {
                Ok(true) => Some(Ok(row)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            })
            .collect();
    }

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if matches(filter, table, row, ctx)? {
            out.push(row);
        }
    }
    Ok(out)
}

fn field_matches(
    table: &str,
    field: &str,
    predicate: &FieldFilter,
    row: &Row,
    ctx: &EvalContext<'_>,
) -> Result<bool, EvalError> {
    match predicate {
        FieldFilter::Relation(rel) => relation_matches(table, field, rel, row, ctx),
        FieldFilter::Nested(inner) => nested_matches(table, field, inner, row, ctx),
        FieldFilter::Equals(expected) => match row.get(field) {
            None if ctx.partial => Ok(true),
            value => Ok(values_equal(value.unwrap_or(&DbValue::Null), expected, false)),
        },
        FieldFilter::Ops { ops, mode } => match row.get(field) {
            None if ctx.partial => Ok(true),
            value => {
                let value = value.unwrap_or(&DbValue::Null);
                let insensitive = *mode == QueryMode::Insensitive;
                for op in ops {
                    if !operator_matches(op, value, insensitive)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        },
    }
}

fn operator_matches(op: &Operator, value: &DbValue, insensitive: bool) -> Result<bool, EvalError> {
    let fold = |s: &str| {
        if insensitive {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    };
    let ordered = |operand: &DbValue, accept: fn(Ordering) -> bool| {
        compare_operands(op.name(), value, operand).map(|ord| ord.is_some_and(accept))
    };
    let list_contains = |items: &[DbValue], needle: &DbValue| items.iter().any(|i| i == needle);

    Ok(match op {
        Operator::Equals(expected) => values_equal(value, expected, insensitive),
        Operator::In(items) => !value.is_null() && items.iter().any(|i| values_equal(value, i, false)),
        Operator::NotIn(items) => {
            !value.is_null() && !items.iter().any(|i| values_equal(value, i, false))
        }
        Operator::Lt(operand) => ordered(operand, |o| o == Ordering::Less)?,
        Operator::Lte(operand) => ordered(operand, |o| o != Ordering::Greater)?,
        Operator::Gt(operand) => ordered(operand, |o| o == Ordering::Greater)?,
        Operator::Gte(operand) => ordered(operand, |o| o != Ordering::Less)?,
        Operator::Contains(needle) => value
            .as_str()
            .is_some_and(|s| fold(s).contains(&fold(needle))),
        Operator::StartsWith(prefix) => value
            .as_str()
            .is_some_and(|s| fold(s).starts_with(&fold(prefix))),
        Operator::EndsWith(suffix) => value
            .as_str()
            .is_some_and(|s| fold(s).ends_with(&fold(suffix))),
        Operator::Has(needle) => value.as_array().is_some_and(|arr| list_contains(arr, needle)),
        Operator::HasEvery(needles) => value
            .as_array()
            .is_some_and(|arr| needles.iter().all(|n| list_contains(arr, n))),
        Operator::HasSome(needles) => value
            .as_array()
            .is_some_and(|arr| needles.iter().any(|n| list_contains(arr, n))),
        Operator::IsEmpty(expected) => value.as_array().is_some_and(|arr| arr.is_empty() == *expected),
    })
}

fn relation_matches(
    table: &str,
    field: &str,
    filter: &RelationFilter,
    row: &Row,
    ctx: &EvalContext<'_>,
) -> Result<bool, EvalError> {
    let relation = ctx.relation(table, field)?;
    if ctx.partial && !has_join_key(relation.kind, &relation.join_field, row) {
        return Ok(true);
    }
    let related = match related_rows(ctx.lookup, relation, row) {
        Related::Rows(rows) => rows,
        Related::Unknown => return Ok(true),
    };

    let inner_ctx = ctx.full();
    let target = relation.target.as_str();
    let any = |w: &Where| -> Result<bool, EvalError> {
        for r in &related {
            if matches(w, target, r, &inner_ctx)? {
                return Ok(true);
            }
        }
        Ok(false)
    };

    if let Some(w) = &filter.some {
        if !any(w)? {
            return Ok(false);
        }
    }
    if let Some(w) = &filter.every {
        for r in &related {
            if !matches(w, target, r, &inner_ctx)? {
                return Ok(false);
            }
        }
    }
    if let Some(w) = &filter.none {
        if any(w)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Nested where on a relation: manyToOne needs the related record to match, oneToMany
/// accepts any matching related row. On a plain JSON column the where applies to the
/// object value.
fn nested_matches(
    table: &str,
    field: &str,
    inner: &Where,
    row: &Row,
    ctx: &EvalContext<'_>,
) -> Result<bool, EvalError> {
    let Some(relation) = ctx.relations.get(table).and_then(|r| r.get(field)) else {
        return match row.get(field) {
            None if ctx.partial => Ok(true),
            Some(DbValue::Object(obj)) => matches(inner, "", obj, &ctx.full()),
            _ => Ok(false),
        };
    };

    if ctx.partial && !has_join_key(relation.kind, &relation.join_field, row) {
        return Ok(true);
    }
    match related_rows(ctx.lookup, relation, row) {
        Related::Unknown => Ok(true),
        Related::Rows(rows) => {
            let inner_ctx = ctx.full();
            for r in rows {
                if matches(inner, &relation.target, r, &inner_ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn has_join_key(kind: RelationKind, join_field: &str, row: &Row) -> bool {
    match kind {
        RelationKind::OneToMany => row.contains_key("id"),
        RelationKind::ManyToOne => row.contains_key(join_field),
    }
}
