use opentelemetry::{KeyValue, metrics::MeterProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    metrics::{MeterProviderBuilder, PeriodicReader, SdkMeterProvider},
};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

pub struct Metrics {
    pub batches_total: opentelemetry::metrics::Counter<u64>,
    pub batch_duration: opentelemetry::metrics::Histogram<f64>,
    pub connections_active: opentelemetry::metrics::UpDownCounter<i64>,
    pub patches_sent: opentelemetry::metrics::Counter<u64>,
    pub recomputed_queries: opentelemetry::metrics::Counter<u64>,
    pub fanout_errors: opentelemetry::metrics::Counter<u64>,

    changes_total: Arc<AtomicU64>,
}

struct RateWindow {
    last_count: u64,
    last_tick: Instant,
}

impl Metrics {
    pub fn new(provider: &SdkMeterProvider) -> Self {
        let meter = provider.meter("lightning");

        let changes_total = Arc::new(AtomicU64::new(0));
        let count_ref = changes_total.clone();
        let window = Arc::new(Mutex::new(RateWindow {
            last_count: 0,
            last_tick: Instant::now(),
        }));

        // Reported once per full minute of observations.
        let _change_rate = meter
            .u64_observable_gauge("lightning_change_rate_per_minute")
            .with_description("Replicated row changes per minute")
            .with_callback(move |observer| {
                let current = count_ref.load(Ordering::Relaxed);
                if let Ok(mut window) = window.lock() {
                    let now = Instant::now();
                    let elapsed = now.duration_since(window.last_tick).as_secs_f64();
                    if elapsed >= 60.0 {
                        let delta = current.saturating_sub(window.last_count);
                        observer.observe((delta as f64 / elapsed * 60.0).round() as u64, &[]);
                        window.last_count = current;
                        window.last_tick = now;
                    }
                }
            })
            .build();

        Self {
            batches_total: meter
                .u64_counter("lightning_batches_total")
                .with_description("Replication batches fanned out")
                .build(),
            batch_duration: meter
                .f64_histogram("lightning_batch_duration_milliseconds")
                .with_description("Fan-out duration per batch")
                .build(),
            connections_active: meter
                .i64_up_down_counter("lightning_connections_active")
                .with_description("Open WebSocket connections")
                .build(),
            patches_sent: meter
                .u64_counter("lightning_patches_sent_total")
                .with_description("Patches pushed to connections")
                .build(),
            recomputed_queries: meter
                .u64_counter("lightning_recomputed_queries_total")
                .with_description("Stored queries re-executed after a change")
                .build(),
            fanout_errors: meter
                .u64_counter("lightning_fanout_errors_total")
                .with_description("Per-connection fan-out failures")
                .build(),
            changes_total,
        }
    }

    pub fn record_changes(&self, count: u64, attributes: &[KeyValue]) {
        self.changes_total.fetch_add(count, Ordering::Relaxed);
        self.batches_total.add(1, attributes);
    }
}

/// Periodic OTLP export when `endpoint` is set; otherwise a provider without readers.
pub fn init_metrics(
    endpoint: Option<&str>,
    service_name: &str,
) -> Result<(SdkMeterProvider, Metrics), anyhow::Error> {
    let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]);
    let mut builder = MeterProviderBuilder::default().with_resource(resource);

    if let Some(endpoint) = endpoint {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?;
        let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(15))
            .build();
        builder = builder.with_reader(reader);
    }

    let provider = builder.build();
    let metrics = Metrics::new(&provider);
    Ok((provider, metrics))
}
