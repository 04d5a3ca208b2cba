use crate::AppState;
use crate::connection::Connection;
use crate::handler;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use lightning::Identity;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drive one WebSocket until either side closes it.
///
/// Replies and pushes share one outbound queue drained by a writer task, so the
/// dispatcher never waits on a slow socket. Messages from the client are handled one
/// at a time, in order.
pub async fn serve(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let conn = Arc::new(Connection::new(identity, tx));

    state.registry.add(conn.clone()).await;
    state.metrics.connections_active.add(1, &[]);
    info!(connection = %conn.id, "Connection opened");

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                debug!(error = %e, "Socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = handler::handle_message(state.store.as_ref(), &state.schema, &conn, &text).await;
                if let Err(e) = conn.send(&reply) {
                    warn!(connection = %conn.id, error = %e, "Failed to queue reply");
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                debug!(connection = %conn.id, "Ignoring binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Socket read failed");
                break;
            }
        }
    }

    state.registry.remove(conn.id).await;
    state.metrics.connections_active.add(-1, &[]);
    writer.abort();
    info!(connection = %conn.id, "Connection closed");
}
