use crate::engine::types::DbValue;
use std::cmp::Ordering;

use super::EvalError;

/// Ordering used by `lt/lte/gt/gte`.
///
/// `Ok(None)` when either side is null; operands of different types are an error.
pub fn compare_operands(
    op: &'static str,
    row: &DbValue,
    operand: &DbValue,
) -> Result<Option<Ordering>, EvalError> {
    match (row, operand) {
        (DbValue::Null, _) | (_, DbValue::Null) => Ok(None),
        (DbValue::Number(a), DbValue::Number(b)) => Ok(a.partial_cmp(b)),
        (DbValue::Str(a), DbValue::Str(b)) => Ok(Some(a.as_str().cmp(b.as_str()))),
        (DbValue::Bool(a), DbValue::Bool(b)) => Ok(Some(a.cmp(b))),
        _ => Err(EvalError::Incomparable {
            op,
            left: row.kind(),
            right: operand.kind(),
        }),
    }
}

/// Total order for sorting; never fails. Nulls (and absent values) sort first, mixed
/// types fall back to a fixed type rank.
pub fn compare_values(a: Option<&DbValue>, b: Option<&DbValue>) -> Ordering {
    let a = a.unwrap_or(&DbValue::Null);
    let b = b.unwrap_or(&DbValue::Null);
    match (a, b) {
        (DbValue::Null, DbValue::Null) => Ordering::Equal,
        (DbValue::Bool(x), DbValue::Bool(y)) => x.cmp(y),
        (DbValue::Number(x), DbValue::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (DbValue::Str(x), DbValue::Str(y)) => x.as_str().cmp(y.as_str()),
        (DbValue::Array(x), DbValue::Array(y)) => {
            for (ia, ib) in x.iter().zip(y.iter()) {
                let cmp = compare_values(Some(ia), Some(ib));
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        (DbValue::Object(x), DbValue::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &DbValue) -> u8 {
    match v {
        DbValue::Null => 0,
        DbValue::Bool(_) => 1,
        DbValue::Number(_) => 2,
        DbValue::Str(_) => 3,
        DbValue::Array(_) => 4,
        DbValue::Object(_) => 5,
    }
}

/// Equality with optional case folding for strings.
pub fn values_equal(a: &DbValue, b: &DbValue, insensitive: bool) -> bool {
    match (a, b) {
        (DbValue::Str(x), DbValue::Str(y)) if insensitive => x.to_lowercase() == y.to_lowercase(),
        _ => a == b,
    }
}
