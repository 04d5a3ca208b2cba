//! Keyed live queries as applications declare them.
//!
//! `{users: {...}, post: {where: {id: 1}}, mine: {table: "posts", ...}}`: a key with an
//! explicit `table` reads that table, a plural key reads the table of the same name,
//! and a singular key reads `key + "s"` and yields one row.

use crate::error::{ClientError, Result};
use indexmap::IndexMap;
use lightning::{QueryParams, TableQuery};
use serde_json::{Map, Value};
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub struct KeyedQuery {
    pub table: Option<SmolStr>,
    pub params: QueryParams,
}

impl KeyedQuery {
    /// `(table, single)` for this key.
    pub fn target(&self, key: &str) -> (SmolStr, bool) {
        match &self.table {
            Some(table) => (table.clone(), false),
            None if key.ends_with('s') => (SmolStr::new(key), false),
            None => (SmolStr::new(format!("{key}s")), true),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LiveQuery {
    pub keys: IndexMap<SmolStr, KeyedQuery>,
}

impl LiveQuery {
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ClientError::Engine(lightning::Error::InvalidQuery(
                "live query must be an object of keyed queries".into(),
            )));
        };
        let mut keys = IndexMap::new();
        for (key, raw) in map {
            let mut raw = match raw {
                Value::Object(obj) => obj,
                other => {
                    return Err(ClientError::Engine(lightning::Error::InvalidQuery(format!(
                        "`{key}` must be an object, got {other}"
                    ))))
                }
            };
            let table = match raw.remove("table") {
                Some(Value::String(t)) => Some(SmolStr::from(t)),
                _ => None,
            };
            let params = QueryParams::from_json(Value::Object(raw))?;
            keys.insert(SmolStr::from(key), KeyedQuery { table, params });
        }
        Ok(Self { keys })
    }

    /// The canonical form; equal shapes need only one registration.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, q) in &self.keys {
            let mut entry = match q.params.to_json() {
                Value::Object(obj) => obj,
                _ => Map::new(),
            };
            if let Some(table) = &q.table {
                entry.insert("table".into(), Value::String(table.to_string()));
            }
            map.insert(key.to_string(), Value::Object(entry));
        }
        Value::Object(map)
    }

    pub fn shape(&self) -> String {
        lightning::service::shape_hash(&self.to_json())
    }

    /// The list sent to the server. Singular keys ask for one row.
    pub fn to_query_list(&self) -> Vec<TableQuery> {
        self.keys
            .iter()
            .map(|(key, q)| {
                let (table, single) = q.target(key);
                let mut params = q.params.clone();
                if single && q.table.is_none() {
                    params.take = Some(params.take.unwrap_or(1));
                }
                TableQuery::new(&table, params)
            })
            .collect()
    }
}
