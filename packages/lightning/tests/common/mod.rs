//! Shared fixtures for the lightning integration suites.
//!
//! A three-model blog schema (users, posts, comments) mapped from physical table
//! names, a seeded in-memory store whose commits are captured on a channel, and
//! helpers turning captured batches into grouped changes.

#![allow(dead_code)]

use lightning::engine::types::{group_changes, row_from_json, row_to_json};
use lightning::{
    ChangeBatch, DataStore, GroupedChanges, Identity, MemoryStore, MutationOutcome, MutationSet,
    QueryList, Row, Schema, TableQuery, TableRows,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn blog_schema() -> Arc<Schema> {
    let schema = Schema::from_json(json!({
        "tables": {"User": "users", "Post": "posts", "Comment": "comments"},
        "relations": {
            "users": {"posts": {"kind": "oneToMany", "target": "posts", "joinField": "authorId"}},
            "posts": {
                "author": {"kind": "manyToOne", "target": "users", "joinField": "authorId"},
                "comments": {"kind": "oneToMany", "target": "comments", "joinField": "postId"}
            },
            "comments": {"post": {"kind": "manyToOne", "target": "posts", "joinField": "postId"}}
        }
    }))
    .expect("schema");
    Arc::new(schema)
}

pub fn blog_fixture() -> Value {
    json!({
        "users": [
            {"id": 1, "name": "John"},
            {"id": 2, "name": "Jane"},
            {"id": 3, "name": "Bob"}
        ],
        "posts": [
            {"id": 10, "authorId": 1, "title": "Hello", "published": true},
            {"id": 11, "authorId": 1, "title": "Draft", "published": false},
            {"id": 12, "authorId": 2, "title": "Jane's", "published": true}
        ],
        "comments": [
            {"id": 100, "postId": 10, "body": "first"},
            {"id": 101, "postId": 12, "body": "nice"}
        ]
    })
}

pub struct Harness {
    pub schema: Arc<Schema>,
    pub store: Arc<MemoryStore>,
    pub feed: mpsc::UnboundedReceiver<ChangeBatch>,
}

impl Harness {
    pub fn new() -> Self {
        let schema = blog_schema();
        let (tx, feed) = mpsc::unbounded_channel();
        let store = MemoryStore::new(schema.clone()).with_feed(tx);
        store.seed(blog_fixture()).expect("seed");
        Self {
            schema,
            store: Arc::new(store),
            feed,
        }
    }

    /// Register `queries` under `query_id` into `list`, returning the initial rows.
    pub async fn register(&self, list: &mut QueryList, query_id: u64, queries: Value) -> TableRows {
        let queries: Vec<TableQuery> = serde_json::from_value(queries).expect("queries");
        let (stored, data) = lightning::service::query::run(
            self.store.as_ref(),
            &Identity::anonymous(),
            &self.schema,
            query_id,
            &queries,
        )
        .await
        .expect("register");
        for q in stored {
            list.upsert(q);
        }
        data
    }

    /// Commit `mutations` and return the grouped changes they produced.
    pub async fn commit(&mut self, mutations: Value) -> (MutationOutcome, GroupedChanges) {
        let sets: Vec<MutationSet> = serde_json::from_value(mutations).expect("mutations");
        let outcome = self
            .store
            .run_transaction(&Identity::anonymous(), &sets)
            .await
            .expect("commit");
        let batch = self.feed.try_recv().unwrap_or_default();
        (outcome, self.group(batch))
    }

    pub fn group(&self, batch: ChangeBatch) -> GroupedChanges {
        group_changes(batch.changes, |t| self.schema.model_for_table(t))
    }
}

pub fn rows(values: Value) -> Vec<Row> {
    match values {
        Value::Array(items) => items.into_iter().map(row_from_json).collect(),
        _ => Vec::new(),
    }
}

pub fn table_json(data: &TableRows) -> Value {
    let mut map = Map::new();
    for (table, rows) in data {
        map.insert(table.to_string(), Value::Array(rows.iter().map(row_to_json).collect()));
    }
    Value::Object(map)
}
