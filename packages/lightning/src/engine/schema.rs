//! Relation map and model registry.
//!
//! A schema file carries two sections:
//!
//! ```yaml
//! tables:            # physical table name -> logical model key
//!   User: users
//!   Post: posts
//! relations:         # model key -> relation name -> relation
//!   users:
//!     posts: { kind: oneToMany, target: posts, joinField: authorId }
//!   posts:
//!     author: { kind: manyToOne, target: users, joinField: authorId }
//! ```
//!
//! `oneToMany` joins `target.joinField == root.id`, `manyToOne` joins
//! `target.id == root.joinField`.

use super::types::FastMap;
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    OneToMany,
    ManyToOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    #[serde(alias = "type")]
    pub kind: RelationKind,
    #[serde(alias = "model", alias = "targetTable")]
    pub target: SmolStr,
    #[serde(alias = "field")]
    pub join_field: SmolStr,
}

impl Relation {
    pub fn one_to_many(target: &str, join_field: &str) -> Self {
        Self {
            kind: RelationKind::OneToMany,
            target: SmolStr::new(target),
            join_field: SmolStr::new(join_field),
        }
    }

    pub fn many_to_one(target: &str, join_field: &str) -> Self {
        Self {
            kind: RelationKind::ManyToOne,
            target: SmolStr::new(target),
            join_field: SmolStr::new(join_field),
        }
    }

    #[inline]
    pub fn is_many(&self) -> bool {
        self.kind == RelationKind::OneToMany
    }
}

/// `table -> relationName -> Relation`. Read-only after load.
pub type RelationMap = IndexMap<SmolStr, IndexMap<SmolStr, Relation>>;

/// A logical model the DataStore knows how to query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// Logical key used on the wire and in the cache (`users`).
    pub key: SmolStr,
    /// Physical table name as it appears in the replication log (`User`).
    pub table: SmolStr,
    /// Singular name (`user`).
    pub singular: SmolStr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaFile {
    #[serde(default)]
    pub tables: IndexMap<SmolStr, SmolStr>,
    #[serde(default)]
    pub relations: RelationMap,
}

/// Model registry built once at start.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    models: IndexMap<SmolStr, Model>,
    physical: FastMap<SmolStr, SmolStr>,
    relations: RelationMap,
}

/// Strip a trailing `s` to get the singular model name.
pub fn single_model_name(key: &str) -> &str {
    key.strip_suffix('s').unwrap_or(key)
}

impl Schema {
    pub fn from_file(file: SchemaFile) -> Result<Self> {
        let mut schema = Schema {
            relations: file.relations,
            ..Default::default()
        };

        for (physical, key) in &file.tables {
            schema.physical.insert(physical.clone(), key.clone());
            schema.models.entry(key.clone()).or_insert_with(|| Model {
                key: key.clone(),
                table: physical.clone(),
                singular: SmolStr::new(single_model_name(key)),
            });
        }

        // Models that only appear in the relation map map to themselves.
        let mut implicit: Vec<SmolStr> = Vec::new();
        for (table, rels) in &schema.relations {
            implicit.push(table.clone());
            implicit.extend(rels.values().map(|r| r.target.clone()));
        }
        for key in implicit {
            if !schema.models.contains_key(&key) {
                schema.physical.entry(key.clone()).or_insert_with(|| key.clone());
                schema.models.insert(
                    key.clone(),
                    Model {
                        key: key.clone(),
                        table: key.clone(),
                        singular: SmolStr::new(single_model_name(&key)),
                    },
                );
            }
        }

        tracing::debug!(
            models = schema.models.len(),
            relations = schema.relations.values().map(|r| r.len()).sum::<usize>(),
            "Schema loaded"
        );
        Ok(schema)
    }

    /// Parse YAML or JSON (JSON is valid YAML).
    pub fn parse(raw: &str) -> Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(raw)?;
        Self::from_file(file)
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let file: SchemaFile = serde_json::from_value(value)?;
        Self::from_file(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Schema(format!("{}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Register a model by key, mapping it to itself as physical table.
    pub fn with_model(mut self, key: &str) -> Self {
        let key = SmolStr::new(key);
        self.physical.entry(key.clone()).or_insert_with(|| key.clone());
        self.models.entry(key.clone()).or_insert_with(|| Model {
            key: key.clone(),
            table: key.clone(),
            singular: SmolStr::new(single_model_name(&key)),
        });
        self
    }

    pub fn with_relation(mut self, table: &str, name: &str, relation: Relation) -> Self {
        let target = relation.target.clone();
        self.relations
            .entry(SmolStr::new(table))
            .or_default()
            .insert(SmolStr::new(name), relation);
        self.with_model(table).with_model(&target)
    }

    pub fn model(&self, key: &str) -> Result<&Model> {
        self.models
            .get(key)
            .ok_or_else(|| Error::UnknownModel(SmolStr::new(key)))
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// Logical model key for a physical table name.
    pub fn model_for_table(&self, physical: &str) -> Option<SmolStr> {
        self.physical.get(physical).cloned()
    }

    pub fn relations(&self) -> &RelationMap {
        &self.relations
    }

    pub fn relation(&self, table: &str, name: &str) -> Option<&Relation> {
        self.relations.get(table)?.get(name)
    }

    pub fn require_relation(&self, table: &str, name: &str) -> Result<&Relation> {
        self.relation(table, name).ok_or_else(|| Error::UnknownRelation {
            table: SmolStr::new(table),
            relation: SmolStr::new(name),
        })
    }
}
