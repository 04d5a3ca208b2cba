//! Shared fixtures for the client suites.

#![allow(dead_code)]

use lightning::{Relation, Schema};
use lightning_client::{LiveQuery, Session};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn blog_schema() -> Arc<Schema> {
    Arc::new(
        Schema::default()
            .with_relation("users", "posts", Relation::one_to_many("posts", "authorId"))
            .with_relation("posts", "author", Relation::many_to_one("users", "authorId")),
    )
}

/// A session connected to an in-memory channel standing in for the socket.
pub fn connected_session() -> (Session, mpsc::UnboundedReceiver<String>) {
    let mut session = Session::new(blog_schema());
    let (tx, rx) = mpsc::unbounded_channel();
    session.connected(tx);
    (session, rx)
}

pub fn live(v: Value) -> LiveQuery {
    LiveQuery::from_json(v).expect("live query")
}

/// Every frame sent so far, parsed.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).expect("json frame"));
    }
    out
}
