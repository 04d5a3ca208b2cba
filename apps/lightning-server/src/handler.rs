use crate::connection::Connection;
use lightning::engine::types::{row_id, union_table_rows};
use lightning::{DataStore, MutationOutcome, Schema, TableRows, service};
use lightning_protocol::{ClientMessage, ServerMessage, wire_deletes};
use tracing::field::Empty;
use tracing::{Span, debug, instrument, warn};

/// Answer one text frame.
///
/// Queries run first and are stored on the connection, then mutations run as one
/// transaction. Every message gets exactly one reply under its `queryId`; failures
/// become `{error, queryId}` and leave the connection open.
#[instrument(
    skip_all,
    fields(connection = %conn.id, query_id = Empty, queries = Empty, mutations = Empty)
)]
pub async fn handle_message(
    store: &dyn DataStore,
    schema: &Schema,
    conn: &Connection,
    text: &str,
) -> ServerMessage {
    let span = Span::current();

    let message = match ClientMessage::parse(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Rejected client message");
            return ServerMessage::error(e.query_id(), e.to_string());
        }
    };
    span.record("query_id", message.query_id);
    span.record("queries", message.queries.len());
    span.record("mutations", message.mutations.len());

    match execute(store, schema, conn, &message).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "Message failed");
            ServerMessage::error(Some(message.query_id), e.to_string())
        }
    }
}

async fn execute(
    store: &dyn DataStore,
    schema: &Schema,
    conn: &Connection,
    message: &ClientMessage,
) -> lightning::Result<ServerMessage> {
    let mut reply = ServerMessage::reply(message.query_id);
    let mut data = TableRows::default();

    if !message.queries.is_empty() {
        let (stored, rows) = service::query::run(
            store,
            &conn.identity,
            schema,
            message.query_id,
            &message.queries,
        )
        .await?;
        conn.register(&stored);
        debug!(stored = stored.len(), "Registered queries");
        data = rows;
    }

    if !message.mutations.is_empty() {
        let MutationOutcome {
            res,
            data: written,
            deletes,
        } = service::mutation::run(store, &conn.identity, schema, &message.mutations).await?;
        union_table_rows(&mut data, written);
        let deleted = deletes
            .into_iter()
            .map(|(table, rows)| (table, rows.iter().filter_map(row_id).cloned().collect::<Vec<_>>()));
        reply = reply.with_res(res).with_deletes(wire_deletes(deleted));
    }

    if !message.queries.is_empty() || !message.mutations.is_empty() {
        reply = reply.with_data(data);
    }
    Ok(reply)
}
