use super::FieldMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smol_str::SmolStr;

/// Largest integer an `f64` represents exactly. Numbers inside this range are
/// written back to JSON as integers so ids survive a round trip unchanged.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Column value. All numbers are `f64`, so integer ids are exact only up to
/// `MAX_SAFE_INTEGER` (2^53 - 1); larger ids should be stored as strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum DbValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(SmolStr),
    Array(Vec<DbValue>),
    Object(FieldMap),
}

impl DbValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DbValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&FieldMap> {
        match self {
            DbValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<DbValue>> {
        match self {
            DbValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get nested value by key (for objects)
    pub fn get(&self, key: &str) -> Option<&DbValue> {
        self.as_object()?.get(key)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Name of the variant, used in evaluation errors.
    pub fn kind(&self) -> &'static str {
        match self {
            DbValue::Null => "null",
            DbValue::Bool(_) => "bool",
            DbValue::Number(_) => "number",
            DbValue::Str(_) => "string",
            DbValue::Array(_) => "array",
            DbValue::Object(_) => "object",
        }
    }
}

impl From<Value> for DbValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => DbValue::Null,
            Value::Bool(b) => DbValue::Bool(b),
            Value::Number(n) => DbValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => DbValue::Str(SmolStr::from(s)),
            Value::Array(arr) => DbValue::Array(arr.into_iter().map(DbValue::from).collect()),
            Value::Object(obj) => DbValue::Object(
                obj.into_iter()
                    .map(|(k, v)| (SmolStr::from(k), DbValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<DbValue> for Value {
    fn from(val: DbValue) -> Self {
        match val {
            DbValue::Null => Value::Null,
            DbValue::Bool(b) => Value::Bool(b),
            DbValue::Number(n) if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER => {
                json!(n as i64)
            }
            DbValue::Number(n) => json!(n),
            DbValue::Str(s) => Value::String(s.to_string()),
            DbValue::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            DbValue::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for DbValue {
    fn from(s: &str) -> Self {
        DbValue::Str(SmolStr::new(s))
    }
}

impl From<f64> for DbValue {
    fn from(n: f64) -> Self {
        DbValue::Number(n)
    }
}

impl From<i64> for DbValue {
    fn from(n: i64) -> Self {
        DbValue::Number(n as f64)
    }
}

impl From<bool> for DbValue {
    fn from(b: bool) -> Self {
        DbValue::Bool(b)
    }
}
