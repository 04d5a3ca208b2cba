//! In-memory DataStore.
//!
//! Rows live per model in insertion order. Transactions stage a copy of the database,
//! apply every mutation to it and swap it in only when all succeeded. Committed
//! transactions are published on an optional change feed in the same shape the
//! replication log produces, so the server can run without an external database.

use super::{DataStore, Identity, MutationOutcome, StoreError};
use crate::engine::eval::{filter_rows, EvalContext, RelatedRowsLookup};
use crate::engine::include::materialize;
use crate::engine::mutation::{Count, MutationAction, MutationSet};
use crate::engine::query::{FieldFilter, QueryParams, Where};
use crate::engine::schema::{Model, Schema};
use crate::engine::types::{
    format_lsn, id_key, merge_row, row_from_json, row_key, ChangeBatch, ChangeOp, DbValue, FastMap, ReplicationChange,
    Row, RowKey, TableRows, ID,
};
use async_trait::async_trait;
use serde_json::Value;
use smol_str::SmolStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// Row-level read access check applied to root rows of `find_many`.
pub type ReadPolicy = Arc<dyn Fn(&Identity, &Model, &Row) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct Table {
    pub name: SmolStr,
    rows: Vec<Row>,
    index: FastMap<RowKey, usize>,
    next_id: i64,
}

impl Table {
    pub fn new(name: SmolStr) -> Self {
        Self {
            name,
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<&Row> {
        self.index.get(key).map(|&i| &self.rows[i])
    }

    /// Insert a new row, assigning the next integer id when it has none.
    fn insert(&mut self, mut row: Row) -> Result<Row, StoreError> {
        let existing = row.get(ID).filter(|v| !v.is_null()).cloned();
        let id = match existing {
            Some(id) => id,
            None => {
                let id = DbValue::from(self.next_id);
                let mut with_id = Row::default();
                with_id.insert(SmolStr::new(ID), id.clone());
                with_id.extend(row.into_iter().filter(|(k, _)| k != ID));
                row = with_id;
                id
            }
        };
        let key = id_key(&id);
        if self.index.contains_key(&key) {
            return Err(StoreError::Conflict {
                model: self.name.clone(),
                id: key.to_string(),
            });
        }
        self.bump_next_id(&id);
        self.index.insert(key, self.rows.len());
        self.rows.push(row.clone());
        Ok(row)
    }

    fn bump_next_id(&mut self, id: &DbValue) {
        if let Some(n) = id.as_f64() {
            if n.fract() == 0.0 && n as i64 >= self.next_id {
                self.next_id = n as i64 + 1;
            }
        }
    }

    /// Merge `patch` into the row, returning `(old, new)`.
    fn update(&mut self, key: &RowKey, patch: &Row) -> Result<(Row, Row), StoreError> {
        let Some(&pos) = self.index.get(key) else {
            return Err(StoreError::NotFound {
                model: self.name.clone(),
                filter: format!("{{id: {key}}}"),
            });
        };
        let old = self.rows[pos].clone();
        let mut new = old.clone();
        merge_row(&mut new, patch);

        let new_key = row_key(&new).ok_or_else(|| StoreError::Invalid {
            model: self.name.clone(),
            action: "update",
            reason: "id cannot be null".into(),
        })?;
        if new_key != *key {
            if self.index.contains_key(&new_key) {
                return Err(StoreError::Conflict {
                    model: self.name.clone(),
                    id: new_key.to_string(),
                });
            }
            self.index.remove(key);
            self.index.insert(new_key, pos);
            if let Some(id) = new.get(ID).cloned() {
                self.bump_next_id(&id);
            }
        }
        self.rows[pos] = new.clone();
        Ok((old, new))
    }

    fn remove(&mut self, key: &RowKey) -> Option<Row> {
        let pos = self.index.remove(key)?;
        let row = self.rows.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(row)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Database {
    pub tables: FastMap<SmolStr, Table>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_table(&mut self, name: &str) -> &mut Table {
        self.tables
            .entry(SmolStr::new(name))
            .or_insert_with(|| Table::new(SmolStr::new(name)))
    }

    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }
}

impl RelatedRowsLookup for Database {
    fn table_rows(&self, table: &str) -> Option<&[Row]> {
        Some(self.get_table(table).map(Table::rows).unwrap_or(&[]))
    }
}

pub struct MemoryStore {
    schema: Arc<Schema>,
    db: RwLock<Database>,
    feed: Option<mpsc::UnboundedSender<ChangeBatch>>,
    policy: Option<ReadPolicy>,
    lsn: AtomicU64,
}

impl MemoryStore {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            db: RwLock::new(Database::new()),
            feed: None,
            policy: None,
            lsn: AtomicU64::new(0),
        }
    }

    /// Publish committed transactions on `feed`.
    pub fn with_feed(mut self, feed: mpsc::UnboundedSender<ChangeBatch>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Continue log positions after `position`, so commits after a restart sort after
    /// the last acknowledged batch.
    pub fn with_start_lsn(mut self, position: u64) -> Self {
        self.lsn = AtomicU64::new(position);
        self
    }

    pub fn with_policy(mut self, policy: ReadPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Load `{model: [rows]}` without publishing changes.
    pub fn seed(&self, fixture: Value) -> Result<usize, StoreError> {
        let Value::Object(tables) = fixture else {
            return Err(StoreError::Invalid {
                model: SmolStr::new("*"),
                action: "seed",
                reason: "fixture must be an object of model -> rows".into(),
            });
        };

        let mut db = self.write()?;
        let mut count = 0;
        for (model, rows) in tables {
            self.schema
                .model(&model)
                .map_err(|_| StoreError::UnknownModel(SmolStr::from(model.as_str())))?;
            let table = db.ensure_table(&model);
            for row in rows.as_array().into_iter().flatten() {
                table.insert(row_from_json(row.clone()))?;
                count += 1;
            }
        }
        debug!(rows = count, "Seeded memory store");
        Ok(count)
    }

    /// Current rows of a model, in insertion order.
    pub fn rows(&self, model: &str) -> Result<Vec<Row>, StoreError> {
        let db = self.read()?;
        Ok(db.get_table(model).map(|t| t.rows().to_vec()).unwrap_or_default())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Database>, StoreError> {
        self.db
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Database>, StoreError> {
        self.db
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    fn model(&self, key: &str) -> Result<&Model, StoreError> {
        self.schema
            .model(key)
            .map_err(|_| StoreError::UnknownModel(SmolStr::new(key)))
    }

    fn publish(&self, changes: Vec<ReplicationChange>) {
        let Some(feed) = &self.feed else {
            return;
        };
        if changes.is_empty() {
            return;
        }
        let seq = self.lsn.fetch_add(1, Ordering::SeqCst) + 1;
        let batch = ChangeBatch {
            lsn: Some(SmolStr::new(format_lsn(seq))),
            changes,
        };
        if feed.send(batch).is_err() {
            warn!("Change feed receiver dropped; transaction not published");
        }
    }
}

/// Keys of rows in `table` matching `filter`, at most `limit`.
fn matching_keys(
    db: &Database,
    schema: &Schema,
    table: &str,
    filter: Option<&Where>,
    limit: Option<usize>,
) -> Result<Vec<RowKey>, StoreError> {
    let rows = db.table_rows(table).unwrap_or(&[]);
    let ctx = EvalContext::new(schema.relations(), db);
    let matched = filter_rows(filter, table, rows.iter().collect(), &ctx)?;
    Ok(matched
        .into_iter()
        .filter_map(row_key)
        .take(limit.unwrap_or(usize::MAX))
        .collect())
}

fn first_match(db: &Database, schema: &Schema, model: &Model, filter: &Where) -> Result<Option<RowKey>, StoreError> {
    Ok(matching_keys(db, schema, &model.key, Some(filter), Some(1))?
        .into_iter()
        .next())
}

fn not_found(model: &Model, filter: &Where) -> StoreError {
    StoreError::NotFound {
        model: model.key.clone(),
        filter: filter.to_json().to_string(),
    }
}

struct Staged<'a> {
    db: Database,
    schema: &'a Schema,
    changes: Vec<ReplicationChange>,
    outcome: MutationOutcome,
}

impl Staged<'_> {
    fn created(&mut self, model: &Model, row: Row) {
        self.changes.push(ReplicationChange::new(
            model.table.clone(),
            ChangeOp::Insert { columns: row.clone() },
        ));
        self.outcome.data.entry(model.key.clone()).or_default().push(row);
    }

    fn updated(&mut self, model: &Model, old: Row, new: Row) {
        self.changes.push(ReplicationChange::new(
            model.table.clone(),
            ChangeOp::Update {
                columns: new.clone(),
                old_keys: old,
            },
        ));
        self.outcome.data.entry(model.key.clone()).or_default().push(new);
    }

    fn removed(&mut self, model: &Model, old: Row, report: bool) {
        self.changes.push(ReplicationChange::new(
            model.table.clone(),
            ChangeOp::Delete { old_keys: old.clone() },
        ));
        if report {
            self.outcome.deletes.entry(model.key.clone()).or_default().push(old);
        }
    }

    fn apply(&mut self, index: usize, model: &Model, action: &MutationAction) -> Result<(), StoreError> {
        match action {
            MutationAction::Create { data } => {
                let row = self.db.ensure_table(&model.key).insert(data.clone())?;
                self.created(model, row);
            }
            MutationAction::CreateMany { data } => {
                for item in data {
                    let row = self.db.ensure_table(&model.key).insert(item.clone())?;
                    self.changes.push(ReplicationChange::new(
                        model.table.clone(),
                        ChangeOp::Insert { columns: row },
                    ));
                }
                self.outcome.res[index] = Some(Count { count: data.len() });
            }
            MutationAction::Update { r#where, data } => {
                let key = first_match(&self.db, self.schema, model, r#where)?
                    .ok_or_else(|| not_found(model, r#where))?;
                let (old, new) = self.db.ensure_table(&model.key).update(&key, data)?;
                self.updated(model, old, new);
            }
            MutationAction::UpdateMany { r#where, data, limit } => {
                let keys = matching_keys(&self.db, self.schema, &model.key, r#where.as_ref(), *limit)?;
                for key in keys {
                    let (old, new) = self.db.ensure_table(&model.key).update(&key, data)?;
                    self.updated(model, old, new);
                }
            }
            MutationAction::Upsert { r#where, create, update } => {
                match first_match(&self.db, self.schema, model, r#where)? {
                    Some(key) => {
                        let (old, new) = self.db.ensure_table(&model.key).update(&key, update)?;
                        self.updated(model, old, new);
                    }
                    None => {
                        let mut row = create.clone();
                        if row_key(&row).is_none() {
                            if let Some(FieldFilter::Equals(id)) = r#where.get(ID) {
                                row.insert(SmolStr::new(ID), id.clone());
                            }
                        }
                        let row = self.db.ensure_table(&model.key).insert(row)?;
                        self.created(model, row);
                    }
                }
            }
            MutationAction::Delete { r#where } => {
                let key = first_match(&self.db, self.schema, model, r#where)?
                    .ok_or_else(|| not_found(model, r#where))?;
                if let Some(old) = self.db.ensure_table(&model.key).remove(&key) {
                    self.removed(model, old, true);
                }
            }
            MutationAction::DeleteMany { r#where, limit } => {
                let keys = matching_keys(&self.db, self.schema, &model.key, r#where.as_ref(), *limit)?;
                let mut count = 0;
                for key in keys {
                    if let Some(old) = self.db.ensure_table(&model.key).remove(&key) {
                        self.removed(model, old, false);
                        count += 1;
                    }
                }
                self.outcome.res[index] = Some(Count { count });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    #[instrument(skip(self, identity, params), fields(model = %model.key))]
    async fn find_many(
        &self,
        identity: &Identity,
        model: &Model,
        params: &QueryParams,
    ) -> Result<Vec<Row>, StoreError> {
        let db = self.read()?;
        let rows = db.table_rows(&model.key).unwrap_or(&[]);
        let candidates: Vec<&Row> = match &self.policy {
            Some(policy) => rows.iter().filter(|r| policy(identity, model, r)).collect(),
            None => rows.iter().collect(),
        };
        let ctx = EvalContext::new(self.schema.relations(), &*db);
        let out = materialize(&model.key, candidates, params, &ctx)?;
        debug!(rows = out.len(), "find_many");
        Ok(out)
    }

    #[instrument(skip(self, _identity, mutations), fields(entries = mutations.len()))]
    async fn run_transaction(
        &self,
        _identity: &Identity,
        mutations: &[MutationSet],
    ) -> Result<MutationOutcome, StoreError> {
        let mut db = self.write()?;
        let mut staged = Staged {
            db: db.clone(),
            schema: self.schema.as_ref(),
            changes: Vec::new(),
            outcome: MutationOutcome {
                res: vec![None; mutations.len()],
                ..Default::default()
            },
        };

        for (index, set) in mutations.iter().enumerate() {
            for (key, action) in &set.ops {
                let model = self.model(key)?;
                staged.apply(index, model, action)?;
            }
        }

        *db = staged.db;
        debug!(changes = staged.changes.len(), "Transaction committed");
        // Positions are taken under the write lock so the feed sees commit order.
        self.publish(staged.changes);
        drop(db);
        Ok(staged.outcome)
    }
}
