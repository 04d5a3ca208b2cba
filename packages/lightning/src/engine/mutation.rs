//! Mutation operations as sent by clients.
//!
//! One entry of a message's `mutations` list is `{model: {action: args}}`. An entry
//! may name several models and several actions; they run in declaration order and
//! share the entry's index in the result list.

use super::query::Where;
use super::types::{row_from_json, row_to_json, Row};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

#[derive(Debug, Clone, PartialEq)]
pub enum MutationAction {
    Create { data: Row },
    CreateMany { data: Vec<Row> },
    Update { r#where: Where, data: Row },
    UpdateMany { r#where: Option<Where>, data: Row, limit: Option<usize> },
    Upsert { r#where: Where, create: Row, update: Row },
    Delete { r#where: Where },
    DeleteMany { r#where: Option<Where>, limit: Option<usize> },
}

impl MutationAction {
    pub fn name(&self) -> &'static str {
        match self {
            MutationAction::Create { .. } => "create",
            MutationAction::CreateMany { .. } => "createMany",
            MutationAction::Update { .. } => "update",
            MutationAction::UpdateMany { .. } => "updateMany",
            MutationAction::Upsert { .. } => "upsert",
            MutationAction::Delete { .. } => "delete",
            MutationAction::DeleteMany { .. } => "deleteMany",
        }
    }

    fn parse(name: &str, args: Value) -> Result<Self> {
        let mut args = match args {
            Value::Object(map) => map,
            other => return Err(invalid(format!("`{name}` expects an object, got {other}"))),
        };

        Ok(match name {
            "create" => MutationAction::Create {
                data: object(name, "data", args.remove("data"))?,
            },
            "createMany" => MutationAction::CreateMany {
                data: match args.remove("data") {
                    Some(Value::Array(items)) => items
                        .into_iter()
                        .map(|item| object(name, "data[]", Some(item)))
                        .collect::<Result<_>>()?,
                    // A single object is accepted as a one-element list.
                    Some(Value::Object(obj)) => vec![row_from_json(Value::Object(obj))],
                    _ => return Err(invalid("`createMany` expects `data` to be a list")),
                },
            },
            "update" => MutationAction::Update {
                r#where: required_where(name, args.remove("where"))?,
                data: object(name, "data", args.remove("data"))?,
            },
            "updateMany" => MutationAction::UpdateMany {
                r#where: optional_where(args.remove("where"))?,
                data: object(name, "data", args.remove("data"))?,
                limit: limit(args.remove("limit"))?,
            },
            "upsert" => MutationAction::Upsert {
                r#where: required_where(name, args.remove("where"))?,
                create: object(name, "create", args.remove("create"))?,
                update: object(name, "update", args.remove("update"))?,
            },
            "delete" => MutationAction::Delete {
                r#where: required_where(name, args.remove("where"))?,
            },
            "deleteMany" => MutationAction::DeleteMany {
                r#where: optional_where(args.remove("where"))?,
                limit: limit(args.remove("limit"))?,
            },
            other => return Err(invalid(format!("unknown mutation `{other}`"))),
        })
    }

    fn to_json(&self) -> Value {
        let mut map = Map::new();
        let mut put = |k: &str, v: Value| {
            map.insert(k.to_string(), v);
        };
        match self {
            MutationAction::Create { data } => put("data", row_to_json(data)),
            MutationAction::CreateMany { data } => {
                put("data", Value::Array(data.iter().map(row_to_json).collect()))
            }
            MutationAction::Update { r#where, data } => {
                put("where", r#where.to_json());
                put("data", row_to_json(data));
            }
            MutationAction::UpdateMany { r#where, data, limit } => {
                if let Some(w) = r#where {
                    put("where", w.to_json());
                }
                put("data", row_to_json(data));
                if let Some(l) = limit {
                    put("limit", (*l).into());
                }
            }
            MutationAction::Upsert { r#where, create, update } => {
                put("where", r#where.to_json());
                put("create", row_to_json(create));
                put("update", row_to_json(update));
            }
            MutationAction::Delete { r#where } => put("where", r#where.to_json()),
            MutationAction::DeleteMany { r#where, limit } => {
                if let Some(w) = r#where {
                    put("where", w.to_json());
                }
                if let Some(l) = limit {
                    put("limit", (*l).into());
                }
            }
        }
        Value::Object(map)
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidMutation(msg.into())
}

fn object(action: &str, field: &str, value: Option<Value>) -> Result<Row> {
    match value {
        Some(v @ Value::Object(_)) => Ok(row_from_json(v)),
        _ => Err(invalid(format!("`{action}.{field}` must be an object"))),
    }
}

fn required_where(action: &str, value: Option<Value>) -> Result<Where> {
    match value {
        Some(v @ Value::Object(_)) => Ok(Where::from_json(v)?),
        _ => Err(invalid(format!("`{action}` requires a `where` object"))),
    }
}

fn optional_where(value: Option<Value>) -> Result<Option<Where>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => Ok(Some(Where::from_json(v)?)),
    }
}

fn limit(value: Option<Value>) -> Result<Option<usize>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| invalid("`limit` must be a non-negative integer")),
        Some(other) => Err(invalid(format!("`limit` must be a number, got {other}"))),
    }
}

/// One entry of a `mutations` list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct MutationSet {
    pub ops: Vec<(SmolStr, MutationAction)>,
}

impl MutationSet {
    pub fn single(model: &str, action: MutationAction) -> Self {
        Self {
            ops: vec![(SmolStr::new(model), action)],
        }
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let map = match value {
            Value::Object(map) => map,
            other => return Err(invalid(format!("mutation must be an object, got {other}"))),
        };
        let mut ops = Vec::new();
        for (model, actions) in map {
            let actions = match actions {
                Value::Object(actions) => actions,
                other => return Err(invalid(format!("`{model}` must map actions, got {other}"))),
            };
            for (name, args) in actions {
                ops.push((SmolStr::from(model.as_str()), MutationAction::parse(&name, args)?));
            }
        }
        Ok(Self { ops })
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (model, action) in &self.ops {
            let entry = map
                .entry(model.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(actions) = entry {
                actions.insert(action.name().to_string(), action.to_json());
            }
        }
        Value::Object(map)
    }
}

impl TryFrom<Value> for MutationSet {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        MutationSet::from_json(value)
    }
}

impl From<MutationSet> for Value {
    fn from(set: MutationSet) -> Self {
        set.to_json()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Count {
    pub count: usize,
}

#[cfg(test)]
mod mutation_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_all_actions() {
        let raw = json!([
            {"posts": {"create": {"data": {"title": "x"}}}},
            {"posts": {"createMany": {"data": [{"title": "a"}, {"title": "b"}]}}},
            {"posts": {"update": {"where": {"id": 1}, "data": {"title": "y"}}}},
            {"posts": {"updateMany": {"where": {"draft": true}, "data": {"draft": false}, "limit": 5}}},
            {"posts": {"upsert": {"where": {"id": 2}, "create": {"title": "n"}, "update": {"title": "u"}}}},
            {"posts": {"delete": {"where": {"id": 3}}}},
            {"posts": {"deleteMany": {}}}
        ]);
        let sets: Vec<MutationSet> = serde_json::from_value(raw.clone()).unwrap();
        let names: Vec<_> = sets.iter().map(|s| s.ops[0].1.name()).collect();
        assert_eq!(
            names,
            vec!["create", "createMany", "update", "updateMany", "upsert", "delete", "deleteMany"]
        );
        assert_eq!(serde_json::to_value(&sets).unwrap(), raw);
    }

    #[test]
    fn test_entry_with_several_models() {
        let set = MutationSet::from_json(json!({
            "users": {"create": {"data": {"name": "a"}}},
            "posts": {"deleteMany": {"where": {"authorId": 1}}}
        }))
        .unwrap();
        assert_eq!(set.ops.len(), 2);
        assert_eq!(set.ops[1].0, "posts");
    }

    #[test]
    fn test_missing_arguments_are_rejected() {
        assert!(MutationSet::from_json(json!({"posts": {"update": {"data": {}}}})).is_err());
        assert!(MutationSet::from_json(json!({"posts": {"create": {}}})).is_err());
        assert!(MutationSet::from_json(json!({"posts": {"explode": {}}})).is_err());
        assert!(MutationSet::from_json(json!({"posts": 1})).is_err());
    }
}
