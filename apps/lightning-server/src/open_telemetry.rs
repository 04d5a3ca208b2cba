use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    logs::LoggerProvider as SdkLoggerProvider,
    propagation::TraceContextPropagator,
    runtime,
    trace::{RandomIdGenerator, Sampler, TracerProvider as SdkTracerProvider},
};
use tracing_subscriber::{Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "lightning=debug,lightning_server=debug,axum=info";

/// Console logging always; OTLP traces and logs when `otlp_endpoint` is set.
pub fn init_tracing(otlp_endpoint: Option<&str>, service_name: &str) -> Result<(), anyhow::Error> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let (telemetry_layer, log_layer) = match otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());

            let resource = Resource::new(vec![KeyValue::new("service.name", service_name.to_string())]);

            let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let tracer_provider = SdkTracerProvider::builder()
                .with_batch_exporter(trace_exporter, runtime::Tokio)
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource.clone())
                .build();
            // Take the tracer before the provider goes global.
            let tracer = tracer_provider.tracer(service_name.to_string());
            global::set_tracer_provider(tracer_provider);

            let log_exporter = opentelemetry_otlp::LogExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;
            let logger_provider = SdkLoggerProvider::builder()
                .with_batch_exporter(log_exporter, runtime::Tokio)
                .with_resource(resource)
                .build();

            (
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
                Some(OpenTelemetryTracingBridge::new(&logger_provider)),
            )
        }
        None => (None, None),
    };

    Registry::default()
        .with(env_filter)
        .with(fmt::layer())
        .with(telemetry_layer)
        .with(log_layer)
        .try_init()?;

    Ok(())
}
