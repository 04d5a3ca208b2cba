//! Stored queries and derived-include synthesis.
//!
//! A stored query remembers what a client asked for plus, for every relation it
//! pulled in, a flat `{table, where}` restricted to the join keys observed in the last
//! execution. The change matcher only ever looks at these.

use super::query::{FieldFilter, Include, IncludeSpec, QueryParams, Where};
use super::schema::{RelationKind, Schema};
use super::types::{DbValue, FastSet, Row, RowKey, id_key, ID};
use smol_str::SmolStr;
use std::sync::Arc;

/// `(queryId, index within the message)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub query_id: u64,
    pub index: u32,
}

impl SlotKey {
    pub fn new(query_id: u64, index: u32) -> Self {
        Self { query_id, index }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DerivedInclude {
    pub table: SmolStr,
    pub params: QueryParams,
}

#[derive(Debug, Clone)]
pub struct StoredQuery {
    pub slot: SlotKey,
    pub table: SmolStr,
    /// Parameters as the client sent them. Shared so a refresh can tell whether the
    /// slot still holds the same registration.
    pub params: Arc<QueryParams>,
    pub derived: Vec<DerivedInclude>,
}

impl StoredQuery {
    /// Every table whose rows this query can put on the client.
    pub fn tables(&self) -> impl Iterator<Item = &SmolStr> {
        std::iter::once(&self.table).chain(self.derived.iter().map(|d| &d.table))
    }
}

/// A connection's registered queries. Cloning is cheap; writers clone, modify and
/// publish the new list.
#[derive(Debug, Clone, Default)]
pub struct QueryList {
    queries: Vec<Arc<StoredQuery>>,
}

impl QueryList {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StoredQuery>> {
        self.queries.iter()
    }

    pub fn get(&self, slot: SlotKey) -> Option<&Arc<StoredQuery>> {
        self.queries.iter().find(|q| q.slot == slot)
    }

    /// Insert or supersede the query in `stored.slot`.
    pub fn upsert(&mut self, stored: StoredQuery) {
        let stored = Arc::new(stored);
        match self.queries.iter_mut().find(|q| q.slot == stored.slot) {
            Some(existing) => *existing = stored,
            None => self.queries.push(stored),
        }
    }

    /// Replace derived includes after a re-execution, unless the slot has been
    /// superseded or removed in the meantime.
    pub fn refresh(&mut self, stored: &StoredQuery) -> bool {
        match self.queries.iter_mut().find(|q| q.slot == stored.slot) {
            Some(existing) if Arc::ptr_eq(&existing.params, &stored.params) => {
                *existing = Arc::new(stored.clone());
                true
            }
            _ => false,
        }
    }

    pub fn remove_query_id(&mut self, query_id: u64) -> usize {
        let before = self.queries.len();
        self.queries.retain(|q| q.slot.query_id != query_id);
        before - self.queries.len()
    }
}

/// The include spec a query is executed with: the client's includes widened with the
/// relations its `where` filters on, so relation filters can be answered from the
/// fetched rows. Client includes win on key clash.
pub fn effective_params(table: &str, params: &QueryParams, schema: &Schema) -> QueryParams {
    let mut effective = params.clone();
    if let Some(w) = params.filter() {
        for (name, include) in filter_includes(table, w, schema) {
            effective.include.entry(name).or_insert(include);
        }
    }
    effective.include = widen_nested(table, effective.include, schema);
    effective
}

fn widen_nested(table: &str, include: IncludeSpec, schema: &Schema) -> IncludeSpec {
    include
        .into_iter()
        .map(|(name, spec)| {
            let spec = match (spec, schema.relation(table, &name)) {
                (Include::Nested(params), Some(rel)) => {
                    Include::Nested(Box::new(effective_params(&rel.target, &params, schema)))
                }
                (other, _) => other,
            };
            (name, spec)
        })
        .collect()
}

/// Includes implied by relation filters in `filter`.
///
/// `some` fetches the matching related rows, `every`/`none` need all of them, and a
/// nested where on a relation fetches the related record (recursively).
pub fn filter_includes(table: &str, filter: &Where, schema: &Schema) -> IncludeSpec {
    let mut out = IncludeSpec::new();
    for (field, predicate) in &filter.fields {
        let Some(relation) = schema.relation(table, field) else {
            continue;
        };
        let include = match predicate {
            FieldFilter::Relation(rel) if rel.every.is_none() && rel.none.is_none() => {
                match &rel.some {
                    Some(inner) => {
                        let params = QueryParams::default().with_where(inner.clone());
                        Include::Nested(Box::new(effective_params(&relation.target, &params, schema)))
                    }
                    None => Include::Flag(true),
                }
            }
            FieldFilter::Relation(_) => Include::Flag(true),
            FieldFilter::Nested(inner) => {
                let nested = filter_includes(&relation.target, inner, schema);
                if nested.is_empty() {
                    Include::Flag(true)
                } else {
                    Include::Nested(Box::new(QueryParams {
                        include: nested,
                        ..Default::default()
                    }))
                }
            }
            _ => continue,
        };
        out.insert(field.clone(), include);
    }
    out
}

/// One derived include per requested relation, its where restricted to the join keys
/// seen in `rows`, recursing into nested rows.
pub fn synthesize_derived(
    table: &str,
    params: &QueryParams,
    rows: &[Row],
    schema: &Schema,
) -> Vec<DerivedInclude> {
    let mut out = Vec::new();
    let basis: Vec<&Row> = rows.iter().collect();
    synthesize_into(&mut out, table, &params.include, &basis, schema);
    out
}

fn synthesize_into(
    out: &mut Vec<DerivedInclude>,
    table: &str,
    include: &IncludeSpec,
    basis: &[&Row],
    schema: &Schema,
) {
    for (name, spec) in include {
        if !spec.is_enabled() {
            continue;
        }
        let Some(relation) = schema.relation(table, name) else {
            tracing::warn!(table, relation = %name, "Include not found in relation map");
            continue;
        };

        let (key_field, source_field) = match relation.kind {
            RelationKind::OneToMany => (relation.join_field.as_str(), ID),
            RelationKind::ManyToOne => (ID, relation.join_field.as_str()),
        };
        let keys = unique_values(basis.iter().filter_map(|r| r.get(source_field)));

        let mut params = spec.params().cloned().unwrap_or_default();
        let mut restricted = params.r#where.take().unwrap_or_default();
        restricted.merge(Where::default().field(key_field, FieldFilter::one_of(keys)));
        params.r#where = Some(restricted);

        let nested_include = std::mem::take(&mut params.include);
        out.push(DerivedInclude {
            table: relation.target.clone(),
            params,
        });

        if nested_include.is_empty() {
            continue;
        }
        let nested_rows: Vec<&Row> = basis
            .iter()
            .filter_map(|r| r.get(name.as_str()))
            .flat_map(|v| match v {
                DbValue::Array(items) => items.iter().filter_map(DbValue::as_object).collect(),
                DbValue::Object(obj) => vec![obj],
                _ => Vec::new(),
            })
            .collect();
        synthesize_into(out, &relation.target, &nested_include, &nested_rows, schema);
    }
}

fn unique_values<'a>(values: impl Iterator<Item = &'a DbValue>) -> Vec<DbValue> {
    let mut seen: FastSet<RowKey> = FastSet::default();
    values
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(id_key(v)))
        .cloned()
        .collect()
}
