//! WebSocket transport driving a [`Session`].

use crate::error::{ClientError, Result};
use crate::session::Session;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Delay before reconnecting after the socket closes or fails to open.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

fn lock(session: &Mutex<Session>) -> Result<std::sync::MutexGuard<'_, Session>> {
    session
        .lock()
        .map_err(|_| ClientError::Transport("session lock poisoned".into()))
}

/// Keep `session` connected to `url` until `shutdown` flips to `true`.
pub async fn run(url: String, session: Arc<Mutex<Session>>, shutdown: watch::Receiver<bool>) -> Result<()> {
    run_with_delay(url, session, shutdown, RECONNECT_DELAY).await
}

/// [`run`] with a custom wait between connection attempts.
pub async fn run_with_delay(
    url: String,
    session: Arc<Mutex<Session>>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_delay: Duration,
) -> Result<()> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        match connect_async(url.as_str()).await {
            Ok((ws, _response)) => {
                info!(url = %url, "Connected");
                let (mut write, mut read) = ws.split();
                let (tx, mut outgoing) = mpsc::unbounded_channel::<String>();
                lock(&session)?.connected(tx);

                loop {
                    tokio::select! {
                        Some(text) = outgoing.recv() => {
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                warn!(error = %e, "Failed to send frame");
                                break;
                            }
                        }
                        frame = read.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = lock(&session)?.handle_message(text.as_str()) {
                                    debug!(error = %e, "Message not applied");
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "WebSocket error");
                                break;
                            }
                        },
                        _ = shutdown.changed() => {
                            let _ = write.send(Message::Close(None)).await;
                            lock(&session)?.disconnected();
                            return Ok(());
                        }
                    }
                }

                lock(&session)?.disconnected();
                info!(url = %url, "Disconnected");
            }
            Err(e) => warn!(url = %url, error = %e, "Connect failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}
