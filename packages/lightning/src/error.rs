//! Error types for the lightning engine

use crate::engine::eval::EvalError;
use crate::store::StoreError;
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Model {0} not found")]
    UnknownModel(SmolStr),

    #[error("Relation {relation} not found on {table}")]
    UnknownRelation { table: SmolStr, relation: SmolStr },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Schema(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
