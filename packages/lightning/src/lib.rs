// src/lib.rs

pub mod engine;
pub mod error;
pub mod service;
pub mod store;

#[cfg(feature = "parallel")]
pub use rayon::prelude::*;

// Re-export commonly used types for convenience
pub use engine::eval::{matches, EvalContext, EvalError, NoLookup, Related, RelatedRowsLookup};
pub use engine::include::{materialize, resolve_includes};
pub use engine::matcher::{change_matches, is_dirty};
pub use engine::mutation::{Count, MutationAction, MutationSet};
pub use engine::query::{Include, IncludeSpec, OrderBy, QueryParams, SortOrder, TableQuery, Where};
pub use engine::recompute::{recompute, DeletedIds, Patch, RecomputeOutcome};
pub use engine::schema::{Model, Relation, RelationKind, RelationMap, Schema};
pub use engine::split::split_result;
pub use engine::subscription::{QueryList, SlotKey, StoredQuery};
pub use engine::types::{
    ChangeBatch, ChangeOp, DbValue, FastMap, GroupedChanges, ReplicationChange, Row, RowKey, TableRows,
};
pub use error::{Error, Result};
pub use store::{DataStore, Identity, MemoryStore, MutationOutcome, StoreError};
