mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::TestServer;
use http_body_util::BodyExt;
use lightning::ChangeOp;
use lightning_server::create_app;
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn wal_log() -> Value {
    json!({
        "lsn": "0/16B3748",
        "timestamp": "2024-05-01 10:00:00.000000+00",
        "change": [
            {"kind": "update", "schema": "public", "table": "Post",
             "columnnames": ["id", "authorId", "title", "published"],
             "columntypes": ["integer", "integer", "text", "boolean"],
             "columnvalues": [11, 1, "Draft", true],
             "oldkeys": {"keynames": ["id"], "keytypes": ["integer"], "keyvalues": [11]}}
        ]
    })
}

fn ingest(body: String, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = TestServer::new(None);
    let (conn, _rx) = server.connect().await;
    server
        .handle(&conn, json!({"queryId": 1, "queries": [{"table": "users"}, {"table": "posts"}]}))
        .await;

    let app = create_app(server.state.clone());
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["queries"], 2);
    assert_eq!(body["models"], 3);
}

#[tokio::test]
async fn test_version_endpoint() {
    let server = TestServer::new(None);
    let app = create_app(server.state.clone());

    let response = app
        .oneshot(Request::builder().uri("/version").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_ingest_enqueues_batch() {
    let mut server = TestServer::new(None);
    let app = create_app(server.state.clone());

    let response = app.oneshot(ingest(wal_log().to_string(), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let batch = server.next_batch();
    assert_eq!(batch.lsn.as_deref(), Some("0/16B3748"));
    assert_eq!(batch.changes.len(), 1);
    assert_eq!(batch.changes[0].table, "Post");
    assert!(matches!(batch.changes[0].op, ChangeOp::Update { .. }));
}

#[tokio::test]
async fn test_ingest_rejects_bad_payloads() {
    let mut server = TestServer::new(None);

    let response = create_app(server.state.clone())
        .oneshot(ingest("{not json".to_string(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mismatched = json!({"change": [
        {"kind": "insert", "table": "Post", "columnnames": ["id", "title"], "columnvalues": [1]}
    ]});
    let response = create_app(server.state.clone())
        .oneshot(ingest(mismatched.to_string(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(server.feed.try_recv().is_err());
}

#[tokio::test]
async fn test_ingest_requires_secret_when_configured() {
    let mut server = TestServer::new(Some("s3cret"));

    let response = create_app(server.state.clone())
        .oneshot(ingest(wal_log().to_string(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = create_app(server.state.clone())
        .oneshot(ingest(wal_log().to_string(), Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(server.feed.try_recv().is_err());

    let response = create_app(server.state.clone())
        .oneshot(ingest(wal_log().to_string(), Some("s3cret")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(server.feed.try_recv().is_ok());
}

#[tokio::test]
async fn test_checkpoint_follows_dispatch() {
    let mut server = TestServer::new(None);
    let app = create_app(server.state.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/checkpoint").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await, json!({"lsn": null, "batches": 0}));

    app.clone()
        .oneshot(ingest(wal_log().to_string(), None))
        .await
        .unwrap();
    let batch = server.next_batch();
    server.dispatcher().dispatch(batch).await;

    let response = app
        .oneshot(Request::builder().uri("/checkpoint").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"lsn": "0/16B3748", "batches": 1}));
}

#[tokio::test]
async fn test_ws_route_requires_upgrade() {
    let server = TestServer::new(None);
    let response = create_app(server.state.clone())
        .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}
