use anyhow::{Context, anyhow};
use axum::{
    Router,
    extract::{Request, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lightning::{ChangeBatch, DataStore, MemoryStore, Schema};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::field::Empty;
use tracing::{Span, error, info, instrument, warn};

// Expose modules for use in main.rs and tests
pub mod auth;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod metrics;
pub mod open_telemetry;
pub mod replication;
pub mod socket;

use checkpoint::CheckpointSaver;
use config::{Config, load_config};
use connection::ConnectionRegistry;
use dispatcher::Dispatcher;
use metrics::Metrics;
use replication::ReplicationLog;

#[derive(Clone)]
pub struct AppState {
    pub schema: Arc<Schema>,
    pub store: Arc<dyn DataStore>,
    pub registry: Arc<ConnectionRegistry>,
    /// Ordered replication feed; store commits and `/ingest` both land here.
    pub feed: mpsc::UnboundedSender<ChangeBatch>,
    pub checkpoint: Arc<CheckpointSaver>,
    pub metrics: Arc<Metrics>,
    pub ingest_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn dispatcher(&self, concurrency: usize) -> Dispatcher {
        Dispatcher::new(
            self.schema.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.checkpoint.clone(),
            self.metrics.clone(),
            concurrency,
        )
    }
}

// --- Setup ---

pub fn load_schema(config: &Config) -> anyhow::Result<Arc<Schema>> {
    let path = config
        .schema_file
        .as_ref()
        .ok_or_else(|| anyhow!("LIGHTNING_SCHEMA_FILE is not set"))?;
    let schema = Schema::load(path).with_context(|| format!("Failed to load schema {}", path.display()))?;
    Ok(Arc::new(schema))
}

/// Build the in-memory store (seeded from `LIGHTNING_SEED_FILE` when set) and the
/// state around it. The store's log positions continue after the saved checkpoint.
/// The returned receiver is the dispatcher's feed.
pub fn build_state(
    config: &Config,
    schema: Arc<Schema>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<(AppState, mpsc::UnboundedReceiver<ChangeBatch>)> {
    let (feed, rx) = mpsc::unbounded_channel();
    let saved = checkpoint::load_checkpoint(&config.checkpoint_path);
    let mut store = MemoryStore::new(schema.clone()).with_feed(feed.clone());
    if let Some(position) = saved.position() {
        store = store.with_start_lsn(position);
    }

    if let Some(path) = &config.seed_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read seed file {}", path.display()))?;
        let fixture = serde_json::from_str(&raw).context("Seed file is not valid JSON")?;
        let rows = store.seed(fixture).context("Failed to seed store")?;
        info!(rows, "Seeded in-memory store");
    }

    let checkpoint = Arc::new(CheckpointSaver::new(
        config.checkpoint_path.clone(),
        saved,
        config.debounce_ms,
    ));

    let state = AppState {
        schema,
        store: Arc::new(store),
        registry: Arc::new(ConnectionRegistry::new()),
        feed,
        checkpoint,
        metrics,
        ingest_secret: config.ingest_secret.as_deref().map(Arc::from),
    };
    Ok((state, rx))
}

// --- Router Setup ---

pub fn create_app(state: AppState) -> Router {
    let ingest = Router::new()
        .route("/ingest", post(ingest_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), ingest_auth));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/checkpoint", get(checkpoint_handler))
        .merge(ingest)
        .with_state(state)
}

// --- Server Lifecycle ---

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = load_config();

    // Initialize observability
    open_telemetry::init_tracing(config.otlp_endpoint.as_deref(), &config.service_name)
        .context("Failed to initialize tracing")?;
    let (meter_provider, metrics) =
        metrics::init_metrics(config.otlp_endpoint.as_deref(), &config.service_name)
            .context("Failed to initialize metrics")?;
    let metrics = Arc::new(metrics);

    info!("Starting lightning server...");

    let schema = load_schema(&config)?;
    let (state, feed) = build_state(&config, schema, metrics)?;

    let saver = state.checkpoint.clone();
    if let Some(lsn) = saver.current().await.lsn {
        info!(lsn = %lsn, "Resuming after checkpoint");
    }
    tokio::spawn(saver.clone().run());

    let dispatcher = Arc::new(state.dispatcher(config.fanout_concurrency));
    let mut replication = tokio::spawn(dispatcher.run(feed));

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .context("Failed to bind port")?;
    info!(addr = %config.listen_addr, "Listening for requests");

    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(saver, meter_provider))
            .await
    };

    tokio::select! {
        res = server => res.context("Server error")?,
        res = &mut replication => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.context("Dispatcher stopped")),
            Err(e) => return Err(anyhow!(e).context("Dispatcher task failed")),
        },
    }

    opentelemetry::global::shutdown_tracer_provider();

    Ok(())
}

async fn shutdown_signal(
    saver: Arc<CheckpointSaver>,
    meter_provider: opentelemetry_sdk::metrics::SdkMeterProvider,
) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, starting graceful shutdown");
    saver.signal_shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if let Err(e) = meter_provider.shutdown() {
        error!(error = %e, "Failed to shutdown meter provider");
    }
}

// --- Middleware ---

async fn ingest_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if auth::secret_matches(req.headers(), state.ingest_secret.as_deref()) {
        next.run(req).await
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// --- Request Handlers ---

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = auth::identity_from_headers(&headers);
    ws.on_upgrade(move |socket| socket::serve(socket, state, identity))
}

/// Ingest handler - enqueues one wal2json transaction on the replication feed
#[instrument(
    skip(state, body),
    fields(lsn = Empty, changes = Empty, payload_size_bytes = Empty)
)]
async fn ingest_handler(State(state): State<AppState>, body: axum::body::Bytes) -> impl IntoResponse {
    let span = Span::current();
    span.record("payload_size_bytes", body.len());

    let batch = match ReplicationLog::parse(&body).and_then(ReplicationLog::into_batch) {
        Ok(batch) => batch,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Invalid replication log");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    if let Some(lsn) = &batch.lsn {
        span.record("lsn", lsn.as_str());
    }
    span.record("changes", batch.changes.len());

    if state.feed.send(batch).is_err() {
        error!("Replication feed is closed");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "connections": state.registry.len().await,
        "queries": state.registry.query_count().await,
        "models": state.schema.models().count(),
    }))
}

async fn version_handler() -> impl IntoResponse {
    axum::Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "mode": "live"
    }))
}

async fn checkpoint_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.checkpoint.current().await)
}
