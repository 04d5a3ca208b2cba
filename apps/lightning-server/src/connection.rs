use anyhow::{Context, anyhow};
use arc_swap::ArcSwap;
use indexmap::IndexMap;
use lightning::{Identity, QueryList, StoredQuery};
use lightning_protocol::ServerMessage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

pub type ConnectionId = Uuid;

/// One open WebSocket: who it is, what it subscribed to, where its frames go.
///
/// The query list is copy-on-write. Matching reads a stable snapshot while
/// registration and recompute publish replacement lists.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    queries: ArcSwap<QueryList>,
    outbound: mpsc::UnboundedSender<String>,
    open: AtomicBool,
}

impl Connection {
    pub fn new(identity: Identity, outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            queries: ArcSwap::from_pointee(QueryList::default()),
            outbound,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn queries(&self) -> Arc<QueryList> {
        self.queries.load_full()
    }

    /// Store the queries of one message, superseding their slots.
    pub fn register(&self, stored: &[StoredQuery]) {
        self.queries.rcu(|current| {
            let mut next = QueryList::clone(current);
            for query in stored {
                next.upsert(query.clone());
            }
            next
        });
    }

    /// Write back re-executed queries. Slots superseded since the snapshot was taken
    /// keep their newer registration.
    pub fn refresh(&self, refreshed: &[StoredQuery]) -> usize {
        if refreshed.is_empty() {
            return 0;
        }
        let mut applied = 0;
        self.queries.rcu(|current| {
            let mut next = QueryList::clone(current);
            applied = refreshed.iter().filter(|q| next.refresh(q)).count();
            next
        });
        applied
    }

    pub fn send(&self, message: &ServerMessage) -> anyhow::Result<()> {
        let text = message.encode().context("Failed to encode message")?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow!("connection {} is closed", self.id))
    }
}

/// Open connections. Only the WebSocket accept and close paths add or remove.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<IndexMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<Connection>) {
        let mut guard = self.connections.write().await;
        guard.insert(connection.id, connection);
        debug!(connections = guard.len(), "Connection added");
    }

    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut guard = self.connections.write().await;
        let removed = guard.shift_remove(&id);
        if let Some(conn) = &removed {
            conn.close();
        }
        debug!(connections = guard.len(), "Connection removed");
        removed
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn query_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.queries().len())
            .sum()
    }
}
