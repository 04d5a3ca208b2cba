//! wal2json replication logs.
//!
//! One log is one committed transaction: `{change: [...], lsn?, timestamp?}`. Column
//! values arrive as parallel name/value arrays and are zipped into rows here.

use anyhow::{Context, bail};
use lightning::engine::types::{ID, row_from_json};
use lightning::{ChangeBatch, ChangeOp, ReplicationChange, Row};
use serde::Deserialize;
use serde_json::{Map, Value};
use smol_str::SmolStr;

#[derive(Deserialize, Debug)]
pub struct ReplicationLog {
    pub change: Vec<WalChange>,
    #[serde(default)]
    pub lsn: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct OldKeys {
    #[serde(default)]
    pub keynames: Vec<String>,
    #[serde(default)]
    pub keyvalues: Vec<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WalChange {
    Insert {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        columnnames: Vec<String>,
        columnvalues: Vec<Value>,
    },
    Update {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        columnnames: Vec<String>,
        columnvalues: Vec<Value>,
        #[serde(default)]
        oldkeys: Option<OldKeys>,
    },
    Delete {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        oldkeys: OldKeys,
    },
}

impl WalChange {
    pub fn table(&self) -> &str {
        match self {
            WalChange::Insert { table, .. }
            | WalChange::Update { table, .. }
            | WalChange::Delete { table, .. } => table,
        }
    }

    pub fn into_change(self) -> anyhow::Result<ReplicationChange> {
        let table = SmolStr::new(self.table());
        let op = match self {
            WalChange::Insert {
                columnnames,
                columnvalues,
                ..
            } => ChangeOp::Insert {
                columns: zip_row(columnnames, columnvalues).with_context(|| format!("insert on {table}"))?,
            },
            WalChange::Update {
                columnnames,
                columnvalues,
                oldkeys,
                ..
            } => {
                let columns =
                    zip_row(columnnames, columnvalues).with_context(|| format!("update on {table}"))?;
                // Without old keys the key did not change.
                let old_keys = match oldkeys {
                    Some(keys) if !keys.keynames.is_empty() => zip_row(keys.keynames, keys.keyvalues)
                        .with_context(|| format!("update oldkeys on {table}"))?,
                    _ => columns
                        .get_key_value(ID)
                        .map(|(k, v)| Row::from_iter([(k.clone(), v.clone())]))
                        .unwrap_or_default(),
                };
                ChangeOp::Update { columns, old_keys }
            }
            WalChange::Delete { oldkeys, .. } => {
                if oldkeys.keynames.is_empty() {
                    bail!("delete on {table} carries no old keys");
                }
                ChangeOp::Delete {
                    old_keys: zip_row(oldkeys.keynames, oldkeys.keyvalues)
                        .with_context(|| format!("delete oldkeys on {table}"))?,
                }
            }
        };
        Ok(ReplicationChange::new(table, op))
    }
}

impl ReplicationLog {
    pub fn parse(body: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(body).context("Invalid replication log")
    }

    pub fn into_batch(self) -> anyhow::Result<ChangeBatch> {
        let changes = self
            .change
            .into_iter()
            .map(WalChange::into_change)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(ChangeBatch {
            lsn: self.lsn.map(SmolStr::from),
            changes,
        })
    }
}

fn zip_row(names: Vec<String>, values: Vec<Value>) -> anyhow::Result<Row> {
    if names.len() != values.len() {
        bail!("{} column names but {} values", names.len(), values.len());
    }
    let map: Map<String, Value> = names.into_iter().zip(values).collect();
    Ok(row_from_json(Value::Object(map)))
}

#[cfg(test)]
mod replication_tests {
    use super::*;
    use lightning::engine::types::row_to_json;
    use serde_json::json;

    fn batch(v: Value) -> anyhow::Result<ChangeBatch> {
        ReplicationLog::parse(v.to_string().as_bytes())?.into_batch()
    }

    #[test]
    fn test_insert_update_delete() {
        let batch = batch(json!({
            "lsn": "0/16B3748",
            "timestamp": "2024-05-01 10:00:00+00",
            "change": [
                {"kind": "insert", "schema": "public", "table": "Post",
                 "columnnames": ["id", "title"], "columntypes": ["int4", "text"],
                 "columnvalues": [1, "a"]},
                {"kind": "update", "schema": "public", "table": "Post",
                 "columnnames": ["id", "title"], "columntypes": ["int4", "text"],
                 "columnvalues": [1, "b"],
                 "oldkeys": {"keynames": ["id"], "keytypes": ["int4"], "keyvalues": [1]}},
                {"kind": "delete", "schema": "public", "table": "User",
                 "oldkeys": {"keynames": ["id"], "keytypes": ["int4"], "keyvalues": [9]}}
            ]
        }))
        .unwrap();

        assert_eq!(batch.lsn.as_deref(), Some("0/16B3748"));
        assert_eq!(batch.changes.len(), 3);
        assert_eq!(batch.changes[0].table, "Post");
        match &batch.changes[1].op {
            ChangeOp::Update { columns, old_keys } => {
                assert_eq!(row_to_json(columns), json!({"id": 1, "title": "b"}));
                assert_eq!(row_to_json(old_keys), json!({"id": 1}));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(batch.changes[2].op.kind(), "delete");
        assert_eq!(batch.changes[2].table, "User");
    }

    #[test]
    fn test_update_without_oldkeys_uses_new_id() {
        let batch = batch(json!({"change": [
            {"kind": "update", "table": "Post", "columnnames": ["id", "title"], "columnvalues": [4, "x"]}
        ]}))
        .unwrap();
        assert_eq!(batch.lsn, None);
        let old = batch.changes[0].op.old_row().cloned().unwrap();
        assert_eq!(row_to_json(&old), json!({"id": 4}));
    }

    #[test]
    fn test_rejects_mismatched_columns_and_unknown_kinds() {
        assert!(
            batch(json!({"change": [
                {"kind": "insert", "table": "Post", "columnnames": ["id", "title"], "columnvalues": [1]}
            ]}))
            .is_err()
        );
        assert!(batch(json!({"change": [{"kind": "truncate", "table": "Post"}]})).is_err());
        assert!(
            batch(json!({"change": [
                {"kind": "delete", "table": "Post", "oldkeys": {"keynames": [], "keyvalues": []}}
            ]}))
            .is_err()
        );
        assert!(batch(json!({"lsn": "0/1"})).is_err());
    }
}
