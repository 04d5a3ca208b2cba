use crate::engine::mutation::MutationSet;
use crate::engine::query::{QueryParams, TableQuery};
use crate::engine::schema::Schema;
use crate::engine::split::split_result;
use crate::engine::subscription::{effective_params, synthesize_derived, SlotKey, StoredQuery};
use crate::engine::types::{union_table_rows, TableRows};
use crate::error::Result;
use crate::store::{DataStore, Identity, MutationOutcome};
use serde_json::Value;
use std::sync::Arc;
use tracing::instrument;

fn hash_value_recursive_blake3(v: &Value, hasher: &mut blake3::Hasher) {
    match v {
        Value::Null => {
            hasher.update(&[0]);
        }
        Value::Bool(b) => {
            hasher.update(&[1]);
            hasher.update(&[*b as u8]);
        }
        Value::Number(n) => {
            hasher.update(&[2]);
            match n.as_f64() {
                Some(f) => hasher.update(&f.to_be_bytes()),
                None => hasher.update(n.to_string().as_bytes()),
            };
        }
        Value::String(s) => {
            hasher.update(&[3]);
            hasher.update(s.as_bytes());
        }
        Value::Array(arr) => {
            hasher.update(&[4]);
            for item in arr {
                hash_value_recursive_blake3(item, hasher);
            }
        }
        Value::Object(obj) => {
            hasher.update(&[5]);
            // Key order is part of the shape.
            for (k, v) in obj {
                hasher.update(k.as_bytes());
                hash_value_recursive_blake3(v, hasher);
            }
        }
    }
}

/// Stable fingerprint of a query list as it goes on the wire. Two subscriptions with the
/// same fingerprint need only one registration.
pub fn shape_hash(queries: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hash_value_recursive_blake3(queries, &mut hasher);
    hasher.finalize().to_hex().to_string()
}

pub mod query {
    use super::*;

    /// Run one client query and build its stored form.
    ///
    /// The include spec is widened with relation-filter includes, derived includes are
    /// synthesized from the nested rows, then the result is split per table.
    #[instrument(skip(store, identity, schema, params), fields(slot = ?slot))]
    pub async fn execute(
        store: &dyn DataStore,
        identity: &Identity,
        schema: &Schema,
        slot: SlotKey,
        table: &str,
        params: Arc<QueryParams>,
    ) -> Result<(StoredQuery, TableRows)> {
        let model = schema.model(table)?;
        let effective = effective_params(&model.key, &params, schema);
        let rows = store.find_many(identity, model, &effective).await?;
        let derived = synthesize_derived(&model.key, &effective, &rows, schema);
        let data = split_result(&model.key, rows, &effective.include, schema.relations());
        tracing::debug!(derived = derived.len(), tables = data.len(), "Executed query");

        let stored = StoredQuery {
            slot,
            table: model.key.clone(),
            params,
            derived,
        };
        Ok((stored, data))
    }

    /// Run every query of one message in order and union their rows per table.
    pub async fn run(
        store: &dyn DataStore,
        identity: &Identity,
        schema: &Schema,
        query_id: u64,
        queries: &[TableQuery],
    ) -> Result<(Vec<StoredQuery>, TableRows)> {
        let mut stored = Vec::with_capacity(queries.len());
        let mut data = TableRows::default();
        for (index, q) in queries.iter().enumerate() {
            let slot = SlotKey::new(query_id, index as u32);
            let (query, rows) =
                execute(store, identity, schema, slot, &q.table, Arc::new(q.params.clone())).await?;
            // An empty result still tells the client the table has been loaded.
            for table in rows.keys() {
                data.entry(table.clone()).or_default();
            }
            union_table_rows(&mut data, rows);
            stored.push(query);
        }
        Ok((stored, data))
    }
}

pub mod mutation {
    use super::*;

    /// Validate model names, then run the whole list as one transaction.
    #[instrument(skip_all, fields(entries = mutations.len()))]
    pub async fn run(
        store: &dyn DataStore,
        identity: &Identity,
        schema: &Schema,
        mutations: &[MutationSet],
    ) -> Result<MutationOutcome> {
        for set in mutations {
            for (model, _) in &set.ops {
                schema.model(model)?;
            }
        }
        Ok(store.run_transaction(identity, mutations).await?)
    }
}
