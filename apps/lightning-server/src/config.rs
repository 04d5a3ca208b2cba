use std::path::PathBuf;

pub struct Config {
    pub listen_addr: String,
    pub schema_file: Option<PathBuf>,
    pub seed_file: Option<PathBuf>,
    pub checkpoint_path: PathBuf,
    pub debounce_ms: u64,
    pub fanout_concurrency: usize,
    pub ingest_secret: Option<String>,
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
}

impl Config {
    /// Build from a key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Config {
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8668".to_string()),
            schema_file: get("LIGHTNING_SCHEMA_FILE").map(PathBuf::from),
            seed_file: get("LIGHTNING_SEED_FILE").map(PathBuf::from),
            checkpoint_path: PathBuf::from(
                get("LIGHTNING_CHECKPOINT_FILE")
                    .unwrap_or_else(|| "data/lightning_checkpoint.json".to_string()),
            ),
            debounce_ms: get("SAVE_DEBOUNCE_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(2000),
            fanout_concurrency: get("LIGHTNING_FANOUT_CONCURRENCY")
                .and_then(|s| s.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(64),
            ingest_secret: get("LIGHTNING_INGEST_SECRET"),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or_else(|| "lightning".to_string()),
        }
    }
}

pub fn load_config() -> Config {
    Config::from_lookup(|key| std::env::var(key).ok())
}
