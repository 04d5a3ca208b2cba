mod common;

use async_trait::async_trait;
use common::{TestServer, data_ids, deleted_ids, next_message};
use lightning::{
    ChangeBatch, DataStore, Identity, Model, MutationOutcome, MutationSet, QueryParams, Row,
    StoreError,
};
use lightning_server::checkpoint::Checkpoint;
use lightning_server::dispatcher::Dispatcher;
use lightning_server::replication::ReplicationLog;
use serde_json::{Value, json};
use std::sync::Arc;

fn wal_batch(log: Value) -> ChangeBatch {
    ReplicationLog::parse(log.to_string().as_bytes())
        .and_then(ReplicationLog::into_batch)
        .unwrap()
}

/// Serves reads from the seeded store, except for identities flagged `broken`.
struct FlakyStore {
    inner: Arc<dyn DataStore>,
}

#[async_trait]
impl DataStore for FlakyStore {
    async fn find_many(
        &self,
        identity: &Identity,
        model: &Model,
        params: &QueryParams,
    ) -> Result<Vec<Row>, StoreError> {
        if identity.0.as_ref().and_then(|v| v.get("broken")).is_some() {
            return Err(StoreError::Unavailable("read replica down".into()));
        }
        self.inner.find_many(identity, model, params).await
    }

    async fn run_transaction(
        &self,
        identity: &Identity,
        mutations: &[MutationSet],
    ) -> Result<MutationOutcome, StoreError> {
        self.inner.run_transaction(identity, mutations).await
    }
}

#[tokio::test]
async fn test_query_reply_registers_slot() {
    let server = TestServer::new(None);
    let (conn, mut rx) = server.connect().await;

    let reply = server
        .handle(
            &conn,
            json!({"queryId": 1, "queries": [{"table": "posts", "where": {"published": true}}]}),
        )
        .await;

    assert_eq!(reply.query_id, Some(1));
    assert!(reply.error.is_none());
    assert_eq!(data_ids(&reply, "posts"), vec![10, 12]);
    assert_eq!(conn.queries().len(), 1);
    // Replies go back through the socket loop, not the outbound queue.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_update_is_pushed_to_subscribers() {
    let mut server = TestServer::new(None);
    let (reader, mut reader_rx) = server.connect().await;
    let (writer, mut writer_rx) = server.connect().await;

    server
        .handle(
            &reader,
            json!({"queryId": 1, "queries": [{"table": "posts", "where": {"published": true}}]}),
        )
        .await;
    let reply = server
        .handle(
            &writer,
            json!({"queryId": 1, "mutations": [
                {"posts": {"update": {"where": {"id": 11}, "data": {"published": true}}}}
            ]}),
        )
        .await;
    assert!(reply.error.is_none(), "{:?}", reply.error);
    assert_eq!(data_ids(&reply, "posts"), vec![11]);

    let batch = server.next_batch();
    let report = server.dispatcher().dispatch(batch).await;
    assert_eq!(report.connections, 2);
    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 0);

    let push = next_message(&mut reader_rx);
    assert!(push.is_push());
    assert_eq!(data_ids(&push, "posts"), vec![10, 11, 12]);
    assert!(push.deletes.is_none());
    assert!(writer_rx.try_recv().is_err());

    assert_eq!(server.state.checkpoint.current().await.lsn.as_deref(), Some("0/1"));
}

#[tokio::test]
async fn test_row_leaving_filter_is_deleted() {
    let mut server = TestServer::new(None);
    let (reader, mut reader_rx) = server.connect().await;

    server
        .handle(
            &reader,
            json!({"queryId": 1, "queries": [{"table": "posts", "where": {"published": true}}]}),
        )
        .await;
    server
        .handle(
            &reader,
            json!({"queryId": 2, "mutations": [
                {"posts": {"update": {"where": {"id": 10}, "data": {"published": false}}}}
            ]}),
        )
        .await;

    let batch = server.next_batch();
    server.dispatcher().dispatch(batch).await;

    let push = next_message(&mut reader_rx);
    assert_eq!(data_ids(&push, "posts"), vec![12]);
    assert_eq!(deleted_ids(&push, "posts"), vec![10]);
}

#[tokio::test]
async fn test_included_rows_are_tracked() {
    let mut server = TestServer::new(None);
    let (reader, mut reader_rx) = server.connect().await;

    let reply = server
        .handle(
            &reader,
            json!({"queryId": 1, "queries": [
                {"table": "users", "where": {"id": 1}, "include": {"posts": true}}
            ]}),
        )
        .await;
    assert_eq!(data_ids(&reply, "users"), vec![1]);
    assert_eq!(data_ids(&reply, "posts"), vec![10, 11]);

    server
        .handle(
            &reader,
            json!({"queryId": 2, "mutations": [
                {"posts": {"update": {"where": {"id": 11}, "data": {"title": "Final"}}}}
            ]}),
        )
        .await;
    let batch = server.next_batch();
    let report = server.dispatcher().dispatch(batch).await;
    assert_eq!(report.sent, 1);

    let push = next_message(&mut reader_rx);
    assert_eq!(data_ids(&push, "posts"), vec![10, 11]);
}

#[tokio::test]
async fn test_unaffected_and_closed_connections_get_nothing() {
    let mut server = TestServer::new(None);
    let (users, mut users_rx) = server.connect().await;
    let (closed, mut closed_rx) = server.connect().await;

    server
        .handle(&users, json!({"queryId": 1, "queries": [{"table": "users"}]}))
        .await;
    server
        .handle(&closed, json!({"queryId": 1, "queries": [{"table": "posts"}]}))
        .await;
    closed.close();

    server
        .handle(
            &users,
            json!({"queryId": 2, "mutations": [{"posts": {"delete": {"where": {"id": 12}}}}]}),
        )
        .await;
    let batch = server.next_batch();
    let report = server.dispatcher().dispatch(batch).await;

    assert_eq!(report.sent, 0);
    assert_eq!(report.closed, 1);
    assert!(users_rx.try_recv().is_err());
    assert!(closed_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unmapped_tables_still_acknowledge() {
    let server = TestServer::new(None);
    let (conn, mut rx) = server.connect().await;
    server
        .handle(&conn, json!({"queryId": 1, "queries": [{"table": "posts"}]}))
        .await;

    let batch = wal_batch(json!({"lsn": "0/9F", "change": [
        {"kind": "insert", "schema": "public", "table": "AuditLog",
         "columnnames": ["id"], "columnvalues": [1]}
    ]}));
    let report = server.dispatcher().dispatch(batch).await;

    assert_eq!(report.connections, 0);
    assert!(rx.try_recv().is_err());
    let checkpoint = server.state.checkpoint.current().await;
    assert_eq!(checkpoint.lsn.as_deref(), Some("0/9F"));
    assert_eq!(checkpoint.batches, 1);
}

#[tokio::test]
async fn test_bad_messages_get_error_replies() {
    let mut server = TestServer::new(None);
    let (conn, _rx) = server.connect().await;

    let reply = server.handle(&conn, json!("not an envelope")).await;
    assert!(reply.error.is_some());
    assert_eq!(reply.query_id, None);

    let reply = server.handle(&conn, json!({"queryId": 3, "queries": 5})).await;
    assert!(reply.error.is_some());
    assert_eq!(reply.query_id, Some(3));

    let reply = server
        .handle(&conn, json!({"queryId": 4, "queries": [{"table": "nope"}]}))
        .await;
    assert!(reply.error.is_some());
    assert_eq!(reply.query_id, Some(4));
    assert!(conn.queries().is_empty());

    let reply = server
        .handle(
            &conn,
            json!({"queryId": 5, "mutations": [
                {"posts": {"create": {"data": {"title": "kept?"}}}},
                {"posts": {"update": {"where": {"id": 999}, "data": {"title": "x"}}}}
            ]}),
        )
        .await;
    assert!(reply.error.is_some());
    assert_eq!(reply.query_id, Some(5));
    assert!(server.feed.try_recv().is_err());
}

#[tokio::test]
async fn test_mutation_reply_carries_counts_and_deletes() {
    let server = TestServer::new(None);
    let (conn, _rx) = server.connect().await;

    let reply = server
        .handle(
            &conn,
            json!({"queryId": 7, "mutations": [
                {"posts": {"delete": {"where": {"id": 11}}}},
                {"comments": {"deleteMany": {}}}
            ]}),
        )
        .await;

    assert!(reply.error.is_none(), "{:?}", reply.error);
    assert_eq!(deleted_ids(&reply, "posts"), vec![11]);
    let res = serde_json::to_value(&reply.res).unwrap();
    assert_eq!(res, json!([null, {"count": 1}]));
}

#[tokio::test]
async fn test_failing_connection_does_not_block_others() {
    let mut server = TestServer::new(None);
    let (healthy, mut healthy_rx) = server.connect().await;
    let (broken, mut broken_rx) = server.connect_as(Identity::new(json!({"broken": true}))).await;

    for conn in [&healthy, &broken] {
        let reply = server
            .handle(conn, json!({"queryId": 1, "queries": [{"table": "posts"}]}))
            .await;
        assert!(reply.error.is_none(), "{:?}", reply.error);
    }
    server
        .handle(
            &healthy,
            json!({"queryId": 2, "mutations": [
                {"posts": {"update": {"where": {"id": 11}, "data": {"title": "Edited"}}}}
            ]}),
        )
        .await;
    let batch = server.next_batch();

    let state = &server.state;
    let dispatcher = Arc::new(Dispatcher::new(
        state.schema.clone(),
        Arc::new(FlakyStore {
            inner: state.store.clone(),
        }),
        state.registry.clone(),
        state.checkpoint.clone(),
        state.metrics.clone(),
        4,
    ));
    let report = dispatcher.dispatch(batch).await;

    assert_eq!(report.connections, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.sent, 1);

    let push = next_message(&mut healthy_rx);
    assert!(push.is_push());
    assert_eq!(data_ids(&push, "posts"), vec![10, 11, 12]);
    assert!(broken_rx.try_recv().is_err());

    let checkpoint = state.checkpoint.current().await;
    assert_eq!(checkpoint.lsn.as_deref(), Some("0/1"));
    assert_eq!(checkpoint.batches, 1);
}

#[tokio::test]
async fn test_restart_resumes_after_saved_checkpoint() {
    let mut server = TestServer::restarted(Checkpoint {
        lsn: Some("0/9F".into()),
        batches: 3,
    });
    assert_eq!(
        server.state.checkpoint.current().await.lsn.as_deref(),
        Some("0/9F")
    );
    let (conn, mut rx) = server.connect().await;
    server
        .handle(&conn, json!({"queryId": 1, "queries": [{"table": "posts"}]}))
        .await;

    // A transaction the previous run already fanned out arrives again.
    let replayed = wal_batch(json!({"lsn": "0/10", "change": [
        {"kind": "insert", "schema": "public", "table": "Post",
         "columnnames": ["id", "authorId", "title"], "columnvalues": [13, 1, "Old"]}
    ]}));
    let report = server.dispatcher().dispatch(replayed).await;
    assert!(report.replayed);
    assert_eq!(report.connections, 0);
    assert!(rx.try_recv().is_err());
    let checkpoint = server.state.checkpoint.current().await;
    assert_eq!(checkpoint.lsn.as_deref(), Some("0/9F"));
    assert_eq!(checkpoint.batches, 3);

    // New commits continue after the saved position and are delivered.
    server
        .handle(
            &conn,
            json!({"queryId": 2, "mutations": [
                {"posts": {"update": {"where": {"id": 10}, "data": {"title": "New"}}}}
            ]}),
        )
        .await;
    let batch = server.next_batch();
    assert_eq!(batch.lsn.as_deref(), Some("0/A0"));
    let report = server.dispatcher().dispatch(batch).await;
    assert!(!report.replayed);
    assert_eq!(report.sent, 1);
    assert!(next_message(&mut rx).is_push());

    let checkpoint = server.state.checkpoint.current().await;
    assert_eq!(checkpoint.lsn.as_deref(), Some("0/A0"));
    assert_eq!(checkpoint.batches, 4);
}
