//! Derives a live query's view from the cache.

use crate::cache::Cache;
use crate::error::Result;
use crate::query::LiveQuery;
use indexmap::IndexMap;
use lightning::engine::types::row_to_json;
use lightning::{materialize, EvalContext, FastMap, Schema};
use serde_json::Value;
use smol_str::SmolStr;
use std::sync::Arc;

/// `key -> rows` (or one row / `null` for singular keys). Keys whose table the cache
/// has never seen are absent.
pub type QueryView = IndexMap<SmolStr, Value>;

/// Views memoized on `(cache version, query shape)`.
#[derive(Default)]
pub struct QueryEngine {
    memo: FastMap<String, (u64, Arc<QueryView>)>,
}

impl QueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&mut self, cache: &Cache, schema: &Schema, query: &LiveQuery) -> Result<Arc<QueryView>> {
        let shape = query.shape();
        if let Some((version, view)) = self.memo.get(&shape) {
            if *version == cache.version() {
                return Ok(view.clone());
            }
        }
        let view = Arc::new(derive_view(cache, schema, query)?);
        self.memo.insert(shape, (cache.version(), view.clone()));
        Ok(view)
    }

    /// Drop memoized views older than the cache.
    pub fn prune(&mut self, cache: &Cache) {
        let version = cache.version();
        self.memo.retain(|_, (v, _)| *v == version);
    }
}

pub fn derive_view(cache: &Cache, schema: &Schema, query: &LiveQuery) -> Result<QueryView> {
    let ctx = EvalContext::new(schema.relations(), cache);
    let mut view = QueryView::new();
    for (key, q) in &query.keys {
        let (table, single) = q.target(key);
        if !cache.contains_table(&table) {
            continue;
        }
        let rows = materialize(&table, cache.rows(&table).iter().collect(), &q.params, &ctx)?;
        let value = if single {
            rows.first().map(row_to_json).unwrap_or(Value::Null)
        } else {
            Value::Array(rows.iter().map(row_to_json).collect())
        };
        view.insert(key.clone(), value);
    }
    Ok(view)
}
