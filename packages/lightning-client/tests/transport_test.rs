mod common;

use common::{blog_schema, live};
use futures::{SinkExt, StreamExt};
use lightning_client::{transport, Session};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("socket ended early: {other:?}"),
        }
    }
}

async fn wait_for(session: &Mutex<Session>, done: impl Fn(&Session) -> bool) {
    timeout(WAIT, async {
        while !done(&session.lock().unwrap()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_reconnect_registers_subscriptions_again() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let session = Arc::new(Mutex::new(Session::new(blog_schema())));
    session
        .lock()
        .unwrap()
        .subscribe(live(json!({"users": {"where": {"id": 1}}})), None);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let client = tokio::spawn(transport::run_with_delay(
        url,
        session.clone(),
        shutdown_rx,
        Duration::from_millis(20),
    ));

    // The registration queued before the socket opened is flushed on connect.
    let mut ws = accept(&listener).await;
    assert_eq!(
        next_frame(&mut ws).await,
        json!({"queryId": 1, "queries": [{"table": "users", "where": {"id": 1}}]})
    );

    // Server frames are forwarded into the session.
    ws.send(Message::text(r#"{"queryId":1,"data":{"users":[{"id":1,"name":"A"}]}}"#.to_string()))
        .await
        .unwrap();
    wait_for(&session, |s| s.query_state(1).is_some_and(|q| !q.is_loading)).await;
    assert_eq!(session.lock().unwrap().cache().rows("users").len(), 1);

    // Drop the connection without a close handshake.
    drop(ws);
    wait_for(&session, |s| !s.is_connected()).await;

    let mut ws = accept(&listener).await;
    assert_eq!(
        next_frame(&mut ws).await,
        json!({"queryId": 2, "queries": [{"table": "users", "where": {"id": 1}}]})
    );
    wait_for(&session, |s| s.is_connected()).await;
    // Cached rows survive the reconnect.
    assert_eq!(session.lock().unwrap().cache().rows("users").len(), 1);

    shutdown.send(true).unwrap();
    timeout(WAIT, client).await.unwrap().unwrap().unwrap();
    assert!(!session.lock().unwrap().is_connected());
}

#[tokio::test]
async fn test_shutdown_while_waiting_to_reconnect() {
    // Nothing listens on this port once the listener is dropped.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let session = Arc::new(Mutex::new(Session::new(blog_schema())));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let client = tokio::spawn(transport::run_with_delay(
        url,
        session.clone(),
        shutdown_rx,
        Duration::from_secs(60),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.send(true).unwrap();
    timeout(WAIT, client).await.unwrap().unwrap().unwrap();
    assert!(!session.lock().unwrap().is_connected());
}
