//! Wire envelopes exchanged over the WebSocket.
//!
//! Client -> server: `{queryId, queries?, mutations?}`.
//! Server -> client: a reply carrying the `queryId` it answers, or a push without one.
//! Deletes travel as `{table: [{id}]}`.

use indexmap::IndexMap;
use lightning::{Count, DbValue, MutationSet, Patch, TableQuery, TableRows};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Not even a `queryId` could be recovered.
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid message {query_id}: {reason}")]
    Invalid { query_id: u64, reason: String },
}

impl ProtocolError {
    /// The id to address the error reply to, when known.
    pub fn query_id(&self) -> Option<u64> {
        match self {
            ProtocolError::Malformed(_) => None,
            ProtocolError::Invalid { query_id, .. } => Some(*query_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClientMessage {
    pub query_id: u64,
    pub queries: Vec<TableQuery>,
    pub mutations: Vec<MutationSet>,
}

/// First parse step: the envelope with untyped payloads.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    query_id: Option<Value>,
    #[serde(default)]
    queries: Option<Value>,
    #[serde(default)]
    mutations: Option<Value>,
}

impl ClientMessage {
    pub fn queries(query_id: u64, queries: Vec<TableQuery>) -> Self {
        Self {
            query_id,
            queries,
            ..Default::default()
        }
    }

    pub fn mutations(query_id: u64, mutations: Vec<MutationSet>) -> Self {
        Self {
            query_id,
            mutations,
            ..Default::default()
        }
    }

    /// Parse a text frame. The envelope is read first so a payload error can still be
    /// answered under the message's `queryId`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let query_id = match envelope.query_id {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| ProtocolError::Malformed(format!("queryId must be a non-negative integer, got {n}")))?,
            Some(other) => return Err(ProtocolError::Malformed(format!("queryId must be a number, got {other}"))),
            None => return Err(ProtocolError::Malformed("missing queryId".into())),
        };
        let invalid = |reason: String| ProtocolError::Invalid { query_id, reason };

        let queries = match envelope.queries {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
        };
        let mutations = match envelope.mutations {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value(raw).map_err(|e| invalid(e.to_string()))?,
        };

        Ok(Self {
            query_id,
            queries,
            mutations,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        if !self.queries.is_empty() {
            map.insert(
                "queries".into(),
                Value::Array(self.queries.iter().map(TableQuery::to_json).collect()),
            );
        }
        if !self.mutations.is_empty() {
            map.insert(
                "mutations".into(),
                Value::Array(self.mutations.iter().map(MutationSet::to_json).collect()),
            );
        }
        map.insert("queryId".into(), self.query_id.into());
        Value::Object(map)
    }

    pub fn encode(&self) -> String {
        self.to_json().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedRow {
    pub id: DbValue,
}

/// `table -> [{id}]`.
pub type WireDeletes = IndexMap<SmolStr, Vec<DeletedRow>>;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<TableRows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletes: Option<WireDeletes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res: Option<Vec<Option<Count>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerMessage {
    pub fn reply(query_id: u64) -> Self {
        Self {
            query_id: Some(query_id),
            ..Default::default()
        }
    }

    /// A push carries no `queryId`.
    pub fn push(patch: Patch) -> Self {
        Self {
            data: (!patch.data.is_empty()).then_some(patch.data),
            deletes: (!patch.deletes.is_empty()).then(|| wire_deletes(patch.deletes)),
            ..Default::default()
        }
    }

    pub fn error(query_id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            query_id,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: TableRows) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_deletes(mut self, deletes: WireDeletes) -> Self {
        self.deletes = (!deletes.is_empty()).then_some(deletes);
        self
    }

    pub fn with_res(mut self, res: Vec<Option<Count>>) -> Self {
        self.res = Some(res);
        self
    }

    pub fn is_push(&self) -> bool {
        self.query_id.is_none()
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// `table -> [id]` to `table -> [{id}]`.
pub fn wire_deletes<I, T>(deletes: I) -> WireDeletes
where
    I: IntoIterator<Item = (SmolStr, T)>,
    T: IntoIterator<Item = DbValue>,
{
    deletes
        .into_iter()
        .map(|(table, ids)| (table, ids.into_iter().map(|id| DeletedRow { id }).collect()))
        .collect()
}
