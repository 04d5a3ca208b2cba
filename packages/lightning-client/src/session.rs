//! Client session: request bookkeeping, optimistic sends and live subscriptions.
//!
//! The session is transport agnostic. A transport hands it a sender on connect, feeds
//! it every text frame and tells it when the connection drops. Messages sent while
//! disconnected are queued and flushed on the next connect; after a reconnect every
//! live subscription is registered again under a fresh id.

use crate::cache::Cache;
use crate::engine::{QueryEngine, QueryView};
use crate::error::{ClientError, Result};
use crate::optimistic::{apply_optimistic, PendingOperation, TempIds, TempRow};
use crate::query::LiveQuery;
use indexmap::IndexMap;
use lightning::engine::types::{id_key, FastSet};
use lightning::{FastMap, MutationSet, RowKey, Schema};
use lightning_protocol::{ClientMessage, ServerMessage};
use smol_str::SmolStr;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Loading and error state of one request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestState {
    pub is_loading: bool,
    pub error: Option<String>,
}

impl RequestState {
    fn loading() -> Self {
        Self {
            is_loading: true,
            error: None,
        }
    }
}

pub type SubscriptionId = u64;

pub type ViewCallback = Box<dyn FnMut(&QueryView) + Send>;

struct Subscription {
    query: LiveQuery,
    shape: String,
    query_id: u64,
    callback: Option<ViewCallback>,
    last: Option<Arc<QueryView>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutgoingKind {
    Query,
    Mutation,
}

struct Outgoing {
    query_id: u64,
    kind: OutgoingKind,
    text: String,
}

pub struct Session {
    schema: Arc<Schema>,
    cache: Cache,
    engine: QueryEngine,
    last_query_id: u64,
    temp_ids: TempIds,
    queries: FastMap<u64, RequestState>,
    mutations: FastMap<u64, RequestState>,
    pending: FastMap<u64, PendingOperation>,
    subscriptions: IndexMap<SubscriptionId, Subscription>,
    last_subscription: SubscriptionId,
    outbox: VecDeque<Outgoing>,
    sink: Option<mpsc::UnboundedSender<String>>,
    was_connected: bool,
}

impl Session {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            cache: Cache::new(),
            engine: QueryEngine::new(),
            last_query_id: 0,
            temp_ids: TempIds::default(),
            queries: FastMap::default(),
            mutations: FastMap::default(),
            pending: FastMap::default(),
            subscriptions: IndexMap::new(),
            last_subscription: 0,
            outbox: VecDeque::new(),
            sink: None,
            was_connected: false,
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn query_state(&self, query_id: u64) -> Option<&RequestState> {
        self.queries.get(&query_id)
    }

    pub fn mutation_state(&self, query_id: u64) -> Option<&RequestState> {
        self.mutations.get(&query_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_count(&self) -> usize {
        self.outbox.len()
    }

    /// Registration id currently backing a subscription.
    pub fn subscription_query_id(&self, id: SubscriptionId) -> Option<u64> {
        self.subscriptions.get(&id).map(|s| s.query_id)
    }

    /// Current view of a subscription, derived from the cache.
    pub fn view(&mut self, id: SubscriptionId) -> Result<Option<Arc<QueryView>>> {
        let Some(sub) = self.subscriptions.get(&id) else {
            return Ok(None);
        };
        Ok(Some(self.engine.derive(&self.cache, &self.schema, &sub.query)?))
    }

    fn next_query_id(&mut self) -> u64 {
        self.last_query_id += 1;
        self.last_query_id
    }

    /// Subscribe to a live query. A shape another subscription already registered is
    /// not sent again.
    pub fn subscribe(&mut self, query: LiveQuery, callback: Option<ViewCallback>) -> SubscriptionId {
        let shape = query.shape();
        let query_id = match self.registered_shape(&shape) {
            Some(query_id) => query_id,
            None => self.register(&query),
        };

        self.last_subscription += 1;
        let id = self.last_subscription;
        self.subscriptions.insert(
            id,
            Subscription {
                query,
                shape,
                query_id,
                callback,
                last: None,
            },
        );
        self.notify();
        id
    }

    /// Replace a subscription's query. Returns whether a new registration was sent.
    pub fn update_subscription(&mut self, id: SubscriptionId, query: LiveQuery) -> bool {
        let shape = query.shape();
        match self.subscriptions.get(&id) {
            Some(sub) if sub.shape == shape => return false,
            Some(_) => {}
            None => return false,
        }
        let query_id = match self.registered_shape(&shape) {
            Some(query_id) => query_id,
            None => self.register(&query),
        };
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.query = query;
            sub.shape = shape;
            sub.query_id = query_id;
        }
        self.notify();
        true
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.shift_remove(&id).is_some()
    }

    fn registered_shape(&self, shape: &str) -> Option<u64> {
        self.subscriptions
            .values()
            .find(|s| s.shape == shape)
            .map(|s| s.query_id)
    }

    fn register(&mut self, query: &LiveQuery) -> u64 {
        let query_id = self.next_query_id();
        self.queries.insert(query_id, RequestState::loading());
        let message = ClientMessage::queries(query_id, query.to_query_list());
        self.send(query_id, OutgoingKind::Query, message.encode());
        query_id
    }

    /// Apply `mutations` optimistically and send them. The cache is snapshotted first
    /// and restored if the server rejects the message.
    pub fn mutate(&mut self, mutations: Vec<MutationSet>) -> Result<u64> {
        let snapshot = self.cache.snapshot();
        let temp_rows = match apply_optimistic(&mut self.cache, &self.schema, &mutations, &mut self.temp_ids) {
            Ok(temp_rows) => temp_rows,
            Err(e) => {
                self.cache.restore(snapshot);
                return Err(e);
            }
        };

        let query_id = self.next_query_id();
        self.pending.insert(
            query_id,
            PendingOperation {
                query_id,
                snapshot,
                temp_rows,
            },
        );
        self.mutations.insert(query_id, RequestState::loading());
        let message = ClientMessage::mutations(query_id, mutations);
        self.send(query_id, OutgoingKind::Mutation, message.encode());
        self.notify();
        Ok(query_id)
    }

    fn send(&mut self, query_id: u64, kind: OutgoingKind, text: String) {
        if let Some(sink) = &self.sink {
            match sink.send(text) {
                Ok(()) => return,
                Err(mpsc::error::SendError(text)) => {
                    warn!(query_id, "Transport closed; queueing message");
                    self.sink = None;
                    self.outbox.push_back(Outgoing { query_id, kind, text });
                    return;
                }
            }
        }
        debug!(query_id, "Not connected; queueing message");
        self.outbox.push_back(Outgoing { query_id, kind, text });
    }

    /// The transport is up. Re-registers subscriptions after a reconnect, then flushes
    /// queued messages.
    pub fn connected(&mut self, sink: mpsc::UnboundedSender<String>) {
        self.sink = Some(sink);
        if self.was_connected {
            self.resync();
        }
        self.was_connected = true;

        while let Some(out) = self.outbox.pop_front() {
            let Some(sink) = &self.sink else {
                self.outbox.push_front(out);
                break;
            };
            if let Err(mpsc::error::SendError(text)) = sink.send(out.text) {
                self.sink = None;
                self.outbox.push_front(Outgoing { text, ..out });
                break;
            }
        }
        info!(subscriptions = self.subscriptions.len(), "Session connected");
    }

    pub fn disconnected(&mut self) {
        if self.sink.take().is_some() {
            info!("Session disconnected");
        }
    }

    /// Register every distinct subscription shape again under fresh ids. Registrations
    /// still queued are superseded by these.
    fn resync(&mut self) {
        let stale: Vec<u64> = self
            .outbox
            .iter()
            .filter(|o| o.kind == OutgoingKind::Query)
            .map(|o| o.query_id)
            .collect();
        self.outbox.retain(|o| o.kind != OutgoingKind::Query);
        for query_id in stale {
            self.queries.remove(&query_id);
        }

        let mut fresh: FastMap<String, u64> = FastMap::default();
        let ids: Vec<SubscriptionId> = self.subscriptions.keys().copied().collect();
        for id in ids {
            let Some(sub) = self.subscriptions.get(&id) else {
                continue;
            };
            let old = sub.query_id;
            let query_id = match fresh.get(&sub.shape) {
                Some(query_id) => *query_id,
                None => {
                    let query = sub.query.clone();
                    let shape = sub.shape.clone();
                    let query_id = self.register(&query);
                    fresh.insert(shape, query_id);
                    query_id
                }
            };
            self.queries.remove(&old);
            if let Some(sub) = self.subscriptions.get_mut(&id) {
                sub.query_id = query_id;
            }
        }
        debug!(registrations = fresh.len(), "Resynced subscriptions");
    }

    /// Handle one text frame from the server.
    pub fn handle_message(&mut self, text: &str) -> Result<()> {
        let message = ServerMessage::parse(text)?;
        let query_id = message.query_id;

        if let Some(error) = message.error {
            if let Some(query_id) = query_id {
                if let Some(pending) = self.pending.remove(&query_id) {
                    debug!(query_id, "Rolling back optimistic update");
                    self.cache.restore(pending.snapshot);
                }
                let failed = RequestState {
                    is_loading: false,
                    error: Some(error.clone()),
                };
                if let Some(state) = self.queries.get_mut(&query_id) {
                    *state = failed.clone();
                }
                if self.mutations.contains_key(&query_id) {
                    self.mutations.insert(query_id, failed);
                }
            }
            self.notify();
            return Err(ClientError::Server { query_id, message: error });
        }

        if let Some(query_id) = query_id {
            if let Some(pending) = self.pending.remove(&query_id) {
                self.remove_temp_rows(&pending.temp_rows);
            }
        }

        let deletes: IndexMap<SmolStr, FastSet<RowKey>> = message
            .deletes
            .unwrap_or_default()
            .into_iter()
            .map(|(table, rows)| (table, rows.iter().map(|r| id_key(&r.id)).collect()))
            .collect();
        self.cache
            .apply_authoritative(message.data.unwrap_or_default(), &deletes);

        if let Some(query_id) = query_id {
            if let Some(state) = self.queries.get_mut(&query_id) {
                *state = RequestState::default();
            }
            self.mutations.remove(&query_id);
        }
        self.notify();
        Ok(())
    }

    fn remove_temp_rows(&mut self, temp_rows: &[TempRow]) {
        let mut by_model: IndexMap<SmolStr, FastSet<RowKey>> = IndexMap::new();
        for temp in temp_rows {
            by_model
                .entry(temp.model.clone())
                .or_default()
                .insert(id_key(&temp.id));
        }
        self.cache.remove_ids(&by_model);
    }

    /// Re-derive every subscription and call back those whose view changed.
    fn notify(&mut self) {
        for sub in self.subscriptions.values_mut() {
            let view = match self.engine.derive(&self.cache, &self.schema, &sub.query) {
                Ok(view) => view,
                Err(e) => {
                    warn!(error = %e, "Failed to derive view");
                    continue;
                }
            };
            if sub.last.as_deref() == Some(view.as_ref()) {
                continue;
            }
            if let Some(callback) = sub.callback.as_mut() {
                callback(&view);
            }
            sub.last = Some(view);
        }
        self.engine.prune(&self.cache);
    }
}
