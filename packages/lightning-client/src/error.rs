use lightning::EvalError;
use lightning_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Engine(#[from] lightning::Error),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("Invalid mutation on {model}: {reason}")]
    InvalidMutation { model: String, reason: String },

    #[error("Server error for message {query_id:?}: {message}")]
    Server { query_id: Option<u64>, message: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
