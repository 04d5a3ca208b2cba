//! Shared setup for the server suites: a blog schema, a seeded in-memory store behind
//! a full `AppState`, and helpers for driving connections without a socket.

#![allow(dead_code)]

use lightning::engine::types::row_to_json;
use lightning::ChangeBatch;
use lightning_protocol::ServerMessage;
use lightning_server::checkpoint::{Checkpoint, save_checkpoint};
use lightning_server::config::Config;
use lightning_server::connection::Connection;
use lightning_server::dispatcher::Dispatcher;
use lightning_server::{AppState, build_state, handler, metrics};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub fn schema_json() -> Value {
    json!({
        "tables": {"User": "users", "Post": "posts", "Comment": "comments"},
        "relations": {
            "users": {"posts": {"kind": "oneToMany", "target": "posts", "joinField": "authorId"}},
            "posts": {
                "author": {"kind": "manyToOne", "target": "users", "joinField": "authorId"},
                "comments": {"kind": "oneToMany", "target": "comments", "joinField": "postId"}
            },
            "comments": {"post": {"kind": "manyToOne", "target": "posts", "joinField": "postId"}}
        }
    })
}

pub fn blog_fixture() -> Value {
    json!({
        "users": [
            {"id": 1, "name": "John"},
            {"id": 2, "name": "Jane"}
        ],
        "posts": [
            {"id": 10, "authorId": 1, "title": "Hello", "published": true},
            {"id": 11, "authorId": 1, "title": "Draft", "published": false},
            {"id": 12, "authorId": 2, "title": "Jane's", "published": true}
        ],
        "comments": [
            {"id": 100, "postId": 10, "body": "first"}
        ]
    })
}

pub struct TestServer {
    pub state: AppState,
    pub feed: mpsc::UnboundedReceiver<ChangeBatch>,
    pub dir: TempDir,
    _provider: SdkMeterProvider,
}

impl TestServer {
    pub fn new(ingest_secret: Option<&str>) -> Self {
        Self::build(ingest_secret, None)
    }

    /// A server starting over a checkpoint file left by an earlier run.
    pub fn restarted(saved: Checkpoint) -> Self {
        Self::build(None, Some(saved))
    }

    fn build(ingest_secret: Option<&str>, saved: Option<Checkpoint>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let schema_path = dir.path().join("schema.json");
        let seed_path = dir.path().join("seed.json");
        let checkpoint_path = dir.path().join("checkpoint.json");
        std::fs::write(&schema_path, schema_json().to_string()).expect("schema file");
        std::fs::write(&seed_path, blog_fixture().to_string()).expect("seed file");
        if let Some(saved) = &saved {
            save_checkpoint(&checkpoint_path, saved).expect("checkpoint file");
        }

        let mut vars: HashMap<&'static str, String> = HashMap::new();
        vars.insert("LIGHTNING_SCHEMA_FILE", schema_path.display().to_string());
        vars.insert("LIGHTNING_SEED_FILE", seed_path.display().to_string());
        vars.insert("LIGHTNING_CHECKPOINT_FILE", checkpoint_path.display().to_string());
        vars.insert("SAVE_DEBOUNCE_MS", "0".to_string());
        if let Some(secret) = ingest_secret {
            vars.insert("LIGHTNING_INGEST_SECRET", secret.to_string());
        }
        let config = Config::from_lookup(|key| vars.get(key).cloned());

        let (provider, metrics) = metrics::init_metrics(None, "lightning-test").expect("metrics");
        let schema = lightning_server::load_schema(&config).expect("schema");
        let (state, feed) = build_state(&config, schema, Arc::new(metrics)).expect("state");
        Self {
            state,
            feed,
            dir,
            _provider: provider,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::new(self.state.dispatcher(4))
    }

    /// Register a connection the way the socket path does, returning its outbound queue.
    pub async fn connect(&self) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        self.connect_as(lightning::Identity::anonymous()).await
    }

    pub async fn connect_as(
        &self,
        identity: lightning::Identity,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(identity, tx));
        self.state.registry.add(conn.clone()).await;
        (conn, rx)
    }

    pub async fn handle(&self, conn: &Connection, message: Value) -> ServerMessage {
        handler::handle_message(
            self.state.store.as_ref(),
            &self.state.schema,
            conn,
            &message.to_string(),
        )
        .await
    }

    /// Next committed batch on the feed.
    pub fn next_batch(&mut self) -> ChangeBatch {
        self.feed.try_recv().expect("a committed batch")
    }
}

pub fn next_message(rx: &mut mpsc::UnboundedReceiver<String>) -> ServerMessage {
    let text = rx.try_recv().expect("a queued message");
    ServerMessage::parse(&text).expect("server message")
}

/// Ids of `table` in a message's `data`, in order.
pub fn data_ids(message: &ServerMessage, table: &str) -> Vec<i64> {
    message
        .data
        .as_ref()
        .and_then(|d| d.get(table))
        .map(|rows| {
            rows.iter()
                .filter_map(|r| row_to_json(r)["id"].as_i64())
                .collect()
        })
        .unwrap_or_default()
}

pub fn deleted_ids(message: &ServerMessage, table: &str) -> Vec<i64> {
    message
        .deletes
        .as_ref()
        .and_then(|d| d.get(table))
        .map(|rows| {
            rows.iter()
                .filter_map(|r| serde_json::to_value(&r.id).ok()?.as_i64())
                .collect()
        })
        .unwrap_or_default()
}
