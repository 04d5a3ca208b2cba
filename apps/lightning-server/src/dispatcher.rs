//! Fan-out of replication batches to open connections.
//!
//! One task consumes the ordered feed. Each batch is grouped by model, then every open
//! connection is matched, recomputed and patched in its own task, bounded by a
//! semaphore. A failing connection is logged and counted; the others proceed. The
//! batch position is acknowledged once every connection task has finished. Batches at
//! or before the checkpoint loaded at startup are skipped.

use crate::checkpoint::CheckpointSaver;
use crate::connection::{Connection, ConnectionRegistry};
use crate::metrics::Metrics;
use anyhow::{Context, anyhow};
use lightning::engine::types::group_changes;
use lightning::{ChangeBatch, DataStore, GroupedChanges, Schema, recompute};
use lightning_protocol::ServerMessage;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::field::Empty;
use tracing::{Span, debug, error, info, instrument, warn};

/// What happened on one connection for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No stored query was affected or the recompute produced nothing new.
    Idle { recomputed: usize },
    Sent { recomputed: usize },
    /// Closed between the snapshot and the send.
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub connections: usize,
    pub sent: usize,
    pub recomputed: usize,
    pub closed: usize,
    pub failed: usize,
    /// Already acknowledged before this process started; not fanned out.
    pub replayed: bool,
}

pub struct Dispatcher {
    schema: Arc<Schema>,
    store: Arc<dyn DataStore>,
    registry: Arc<ConnectionRegistry>,
    checkpoint: Arc<CheckpointSaver>,
    metrics: Arc<Metrics>,
    limit: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        schema: Arc<Schema>,
        store: Arc<dyn DataStore>,
        registry: Arc<ConnectionRegistry>,
        checkpoint: Arc<CheckpointSaver>,
        metrics: Arc<Metrics>,
        concurrency: usize,
    ) -> Self {
        Self {
            schema,
            store,
            registry,
            checkpoint,
            metrics,
            limit: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Consume `feed` in order. Returns only when the feed closes, which is an error:
    /// the process should exit and resume from the last checkpoint.
    pub async fn run(self: Arc<Self>, mut feed: mpsc::UnboundedReceiver<ChangeBatch>) -> anyhow::Result<()> {
        info!("Dispatcher started");
        while let Some(batch) = feed.recv().await {
            self.dispatch(batch).await;
        }
        error!("Replication feed closed");
        Err(anyhow!("replication feed closed"))
    }

    #[instrument(
        skip(self, batch),
        fields(lsn = ?batch.lsn, changes = batch.changes.len(), tables = Empty, connections = Empty)
    )]
    pub async fn dispatch(self: &Arc<Self>, batch: ChangeBatch) -> FanoutReport {
        if self.checkpoint.is_replayed(batch.lsn.as_deref()) {
            debug!("Skipping batch at or before the resume checkpoint");
            return FanoutReport {
                replayed: true,
                ..Default::default()
            };
        }

        let start = Instant::now();
        let span = Span::current();
        let change_count = batch.changes.len() as u64;
        let lsn = batch.lsn.clone();

        let changes = Arc::new(group_changes(batch.changes, |table| self.schema.model_for_table(table)));
        span.record("tables", changes.len());

        let mut report = FanoutReport::default();
        if !changes.is_empty() {
            let connections = self.registry.snapshot().await;
            span.record("connections", connections.len());
            report = self.fan_out(connections, changes).await;
        }

        self.checkpoint.acknowledge(lsn.as_deref()).await;

        self.metrics.record_changes(change_count, &[]);
        self.metrics
            .batch_duration
            .record(start.elapsed().as_secs_f64() * 1000.0, &[]);
        debug!(
            sent = report.sent,
            recomputed = report.recomputed,
            failed = report.failed,
            "Batch dispatched"
        );
        report
    }

    async fn fan_out(self: &Arc<Self>, connections: Vec<Arc<Connection>>, changes: Arc<GroupedChanges>) -> FanoutReport {
        let mut report = FanoutReport {
            connections: connections.len(),
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for conn in connections {
            if !conn.is_open() {
                report.closed += 1;
                continue;
            }
            let permit = match Arc::clone(&self.limit).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Fan-out semaphore closed");
                    break;
                }
            };
            let this = Arc::clone(self);
            let changes = Arc::clone(&changes);
            tasks.spawn(async move {
                let _permit = permit;
                let id = conn.id;
                (id, this.deliver(&conn, &changes).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Delivery::Sent { recomputed }))) => {
                    report.sent += 1;
                    report.recomputed += recomputed;
                }
                Ok((_, Ok(Delivery::Idle { recomputed }))) => report.recomputed += recomputed,
                Ok((_, Ok(Delivery::Closed))) => report.closed += 1,
                Ok((id, Err(e))) => {
                    report.failed += 1;
                    warn!(connection = %id, error = %format!("{e:#}"), "Fan-out failed for connection");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(error = %e, "Fan-out task panicked");
                }
            }
        }

        self.metrics.patches_sent.add(report.sent as u64, &[]);
        self.metrics.recomputed_queries.add(report.recomputed as u64, &[]);
        if report.failed > 0 {
            self.metrics.fanout_errors.add(report.failed as u64, &[]);
        }
        report
    }

    /// Match, recompute and send for one connection.
    pub async fn deliver(&self, conn: &Connection, changes: &GroupedChanges) -> anyhow::Result<Delivery> {
        let queries = conn.queries();
        if queries.is_empty() {
            return Ok(Delivery::Idle { recomputed: 0 });
        }

        let outcome = recompute(self.store.as_ref(), &conn.identity, &self.schema, &queries, changes)
            .await
            .context("recompute failed")?;
        conn.refresh(&outcome.refreshed);

        let Some(patch) = outcome.patch else {
            return Ok(Delivery::Idle {
                recomputed: outcome.recomputed,
            });
        };
        if !conn.is_open() {
            return Ok(Delivery::Closed);
        }
        conn.send(&ServerMessage::push(patch))?;
        Ok(Delivery::Sent {
            recomputed: outcome.recomputed,
        })
    }
}
