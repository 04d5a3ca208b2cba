//! Predicate evaluation shared by the server matcher, the in-memory store and the
//! client cache.

pub mod compare;
pub mod filter;

pub use compare::{compare_operands, compare_values, values_equal};
pub use filter::{filter_rows, matches};

use crate::engine::schema::{Relation, RelationKind, RelationMap};
use crate::engine::types::{Row, TableRows, ID};
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Cannot compare {left} with {right} using `{op}`")]
    Incomparable {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("Relation {relation} not found on {table}")]
    UnknownRelation { table: SmolStr, relation: SmolStr },
}

/// Source of related rows for relation filters and includes.
pub trait RelatedRowsLookup: Sync {
    /// Every row of `table`, or `None` when this source cannot see the table.
    fn table_rows(&self, table: &str) -> Option<&[Row]>;
}

/// Lookup for payloads that carry no related data (WAL changes).
pub struct NoLookup;

impl RelatedRowsLookup for NoLookup {
    fn table_rows(&self, _table: &str) -> Option<&[Row]> {
        None
    }
}

impl RelatedRowsLookup for TableRows {
    fn table_rows(&self, table: &str) -> Option<&[Row]> {
        Some(self.get(table).map(Vec::as_slice).unwrap_or(&[]))
    }
}

pub enum Related<'a> {
    Rows(Vec<&'a Row>),
    Unknown,
}

/// Candidate rows of `relation` for `root`.
///
/// `oneToMany`: `target.joinField == root.id`. `manyToOne`: `target.id == root.joinField`.
pub fn related_rows<'a>(
    lookup: &'a dyn RelatedRowsLookup,
    relation: &Relation,
    root: &Row,
) -> Related<'a> {
    let Some(rows) = lookup.table_rows(&relation.target) else {
        return Related::Unknown;
    };

    let (key_field, key) = match relation.kind {
        RelationKind::OneToMany => (relation.join_field.as_str(), root.get(ID)),
        RelationKind::ManyToOne => (ID, root.get(relation.join_field.as_str())),
    };
    let Some(key) = key.filter(|k| !k.is_null()) else {
        return Related::Rows(Vec::new());
    };

    let found = rows
        .iter()
        .filter(|r| r.get(key_field) == Some(key))
        .collect::<Vec<_>>();

    Related::Rows(match relation.kind {
        RelationKind::OneToMany => found,
        RelationKind::ManyToOne => found.into_iter().take(1).collect(),
    })
}

#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub relations: &'a RelationMap,
    pub lookup: &'a dyn RelatedRowsLookup,
    /// The row holds only some columns; predicates on absent columns are unknown and match.
    pub partial: bool,
}

impl<'a> EvalContext<'a> {
    pub fn new(relations: &'a RelationMap, lookup: &'a dyn RelatedRowsLookup) -> Self {
        Self {
            relations,
            lookup,
            partial: false,
        }
    }

    /// Context for raw WAL rows: no related data, absent columns unknown.
    pub fn for_change(relations: &'a RelationMap, partial: bool) -> Self {
        Self {
            relations,
            lookup: &NoLookup,
            partial,
        }
    }

    pub fn relation(&self, table: &str, name: &str) -> Result<&'a Relation, EvalError> {
        self.relations
            .get(table)
            .and_then(|rels| rels.get(name))
            .ok_or_else(|| EvalError::UnknownRelation {
                table: SmolStr::new(table),
                relation: SmolStr::new(name),
            })
    }

    fn full(self) -> Self {
        Self {
            partial: false,
            ..self
        }
    }
}
