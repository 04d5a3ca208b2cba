//! The DataStore boundary: the relational engine and its access control.

pub mod memory;

pub use memory::{MemoryStore, ReadPolicy};

use crate::engine::eval::EvalError;
use crate::engine::mutation::{Count, MutationSet};
use crate::engine::query::QueryParams;
use crate::engine::schema::Model;
use crate::engine::types::{Row, TableRows};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Model {0} not found")]
    UnknownModel(SmolStr),

    #[error("No {model} record matches {filter}")]
    NotFound { model: SmolStr, filter: String },

    #[error("{model} with id {id} already exists")]
    Conflict { model: SmolStr, id: String },

    #[error("Invalid {action} on {model}: {reason}")]
    Invalid {
        model: SmolStr,
        action: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Caller identity the store evaluates access under. Opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub Option<Value>);

impl Identity {
    pub fn anonymous() -> Self {
        Identity(None)
    }

    pub fn new(value: Value) -> Self {
        Identity(Some(value))
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_none()
    }
}

/// What a transaction produced, per mutation entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationOutcome {
    /// `{count}` for createMany/deleteMany entries, `None` otherwise.
    pub res: Vec<Option<Count>>,
    /// Rows created or updated, by model key.
    pub data: TableRows,
    /// Rows removed by `delete`, by model key.
    pub deletes: TableRows,
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn find_many(
        &self,
        identity: &Identity,
        model: &Model,
        params: &QueryParams,
    ) -> Result<Vec<Row>, StoreError>;

    /// Run every mutation atomically: either all apply or none do.
    async fn run_transaction(
        &self,
        identity: &Identity,
        mutations: &[MutationSet],
    ) -> Result<MutationOutcome, StoreError>;
}
