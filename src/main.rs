//! Write-Back Store daemon
//!
//! Runs the write-back store against a configured key-value cache and
//! persistent storage backend, exposing health and metrics endpoints, and
//! offers one-shot commands for seeding and recovering cached task state.
//!
//! # Commands
//!
//! ```text
//! writeback-store serve                       Listen for reminder expirations and flush
//! writeback-store write -p P -t T -f FILE     Cache FILE as the live state of task T
//! writeback-store flush -k KEY                Flush the cached state of KEY now
//! ```

use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use writeback_store::{
    cache, storage, CacheBackend, Error, Result, Settings, StateMetadata, StorageBackend,
    WriteBackStatsSnapshot, WriteBackStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Write-back cache between a TTL key-value store and persistent storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "WRITEBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Key-value cache backend (redis, memory)
    #[arg(long, env = "CACHE_BACKEND")]
    cache_backend: Option<CacheBackend>,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Persistent storage backend (file, memory)
    #[arg(long, env = "STORAGE_BACKEND")]
    storage_backend: Option<StorageBackend>,

    /// Root directory of the file storage backend
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Seconds cached values live without being rewritten
    #[arg(long, env = "WRITEBACK_TIMEOUT")]
    timeout: Option<u64>,

    /// Seconds of quiet before pending actions are flushed
    #[arg(long, env = "WRITEBACK_TIME_FOR_WRITE")]
    time_for_write: Option<u64>,

    /// Pending actions that force an immediate flush
    #[arg(long, env = "WRITEBACK_NUM_ACTIONS_FOR_WRITE")]
    num_actions_for_write: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the store until interrupted, flushing on reminder expiry
    Serve {
        /// Health server bind address
        #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
        health_addr: String,

        /// Metrics server bind address
        #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
        metrics_addr: String,
    },

    /// Cache a file as the live state of a task
    Write {
        /// Project name
        #[arg(short, long)]
        project: String,

        /// Task id
        #[arg(short, long)]
        task: String,

        /// File holding the serialized task state
        #[arg(short, long)]
        file: PathBuf,

        /// Actions folded into this state
        #[arg(short, long, default_value = "1")]
        actions: u64,
    },

    /// Flush the cached state of a key to persistent storage now
    Flush {
        /// Cache key of the task state
        #[arg(short, long)]
        key: String,
    },
}

impl Args {
    /// Merge the settings file with command line overrides
    fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_yaml_file(path)?,
            None => Settings::default(),
        };

        if let Some(backend) = self.cache_backend {
            settings.cache.backend = backend;
        }
        if let Some(url) = &self.redis_url {
            settings.cache.url = url.clone();
        }
        if let Some(backend) = self.storage_backend {
            settings.storage.backend = backend;
        }
        if let Some(dir) = &self.data_dir {
            settings.storage.root = dir.clone();
        }
        if let Some(timeout) = self.timeout {
            settings.write_back.timeout_secs = timeout;
        }
        if let Some(time_for_write) = self.time_for_write {
            settings.write_back.time_for_write_secs = time_for_write;
        }
        if let Some(num_actions) = self.num_actions_for_write {
            settings.write_back.num_actions_for_write = num_actions;
        }

        settings.write_back.validate()?;
        Ok(settings)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let settings = args.settings()?;
    info!("Starting Write-Back Store");
    info!("  Version: {}", writeback_store::VERSION);
    info!("  Cache: {} ({})", settings.cache.backend, settings.cache.url);
    info!("  Storage: {} ({})", settings.storage.backend, settings.storage.root.display());

    let cache = cache::connect(&settings.cache).await?;
    let storage = storage::open(&settings.storage).await?;
    match args.command {
        Command::Serve {
            health_addr,
            metrics_addr,
        } => {
            let store = WriteBackStore::start(settings.write_back, cache, storage).await?;
            let outcome = serve(store.clone(), health_addr, metrics_addr).await;
            store.shutdown().await;
            outcome
        }
        // One-shot commands leave the expiry path to the serving process
        Command::Write {
            project,
            task,
            file,
            actions,
        } => {
            let store = WriteBackStore::open(settings.write_back, cache, storage)?;
            write(&store, project, task, file, actions).await
        }
        Command::Flush { key } => {
            let store = WriteBackStore::open(settings.write_back, cache, storage)?;
            let file_key = store.flush_now(&key).await?;
            info!(key = %key, file_key = %file_key, "Flushed");
            Ok(())
        }
    }
}

async fn serve(store: Arc<WriteBackStore>, health_addr: String, metrics_addr: String) -> Result<()> {
    // Start health server
    let health_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_store).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_store).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("Listening for reminder expirations, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    Ok(())
}

async fn write(
    store: &WriteBackStore,
    project: String,
    task: String,
    file: PathBuf,
    actions: u64,
) -> Result<()> {
    let value = tokio::fs::read(&file).await?;
    let metadata = StateMetadata::new(project, task);
    let key = metadata.save_dir();

    store
        .set_ex_with_reminder(&key, Bytes::from(value), &metadata, actions)
        .await?;
    info!(
        key = %key,
        pending_actions = store.pending_actions(&key).await?,
        "Cached task state"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = ["hyper=warn", "redis=info"]
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(
            EnvFilter::from_default_env().add_directive(level.into()),
            |filter, directive| filter.add_directive(directive),
        );

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, store: Arc<WriteBackStore>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let store = store.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let store = store.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" => match store.health_check().await {
                            Ok(true) => respond(StatusCode::OK, "ok"),
                            Ok(false) => respond(StatusCode::SERVICE_UNAVAILABLE, "backend unhealthy"),
                            Err(e) => respond(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Prometheus gauges mirroring the store counters
struct StoreGauges {
    writes: prometheus::IntGauge,
    actions_applied: prometheus::IntGauge,
    flushes: prometheus::IntGaugeVec,
    flush_failures: prometheus::IntGauge,
    consistency_violations: prometheus::IntGauge,
    ignored_expirations: prometheus::IntGauge,
    bytes_flushed: prometheus::IntGauge,
}

impl StoreGauges {
    fn register() -> std::result::Result<Self, prometheus::Error> {
        Ok(Self {
            writes: prometheus::register_int_gauge!(
                "writeback_writes_total",
                "Writes accepted by the write-back store"
            )?,
            actions_applied: prometheus::register_int_gauge!(
                "writeback_actions_applied_total",
                "Actions folded into accepted writes"
            )?,
            flushes: prometheus::register_int_gauge_vec!(
                "writeback_flushes_total",
                "Successful flushes to persistent storage",
                &["trigger"]
            )?,
            flush_failures: prometheus::register_int_gauge!(
                "writeback_flush_failures_total",
                "Flushes that failed to reach persistent storage"
            )?,
            consistency_violations: prometheus::register_int_gauge!(
                "writeback_consistency_violations_total",
                "Expired reminders whose cached state was already gone"
            )?,
            ignored_expirations: prometheus::register_int_gauge!(
                "writeback_ignored_expirations_total",
                "Expiration events for keys that are not reminders"
            )?,
            bytes_flushed: prometheus::register_int_gauge!(
                "writeback_bytes_flushed_total",
                "Bytes saved to persistent storage"
            )?,
        })
    }

    fn update(&self, stats: &WriteBackStatsSnapshot) {
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        self.writes.set(as_i64(stats.writes));
        self.actions_applied.set(as_i64(stats.actions_applied));
        self.flushes
            .with_label_values(&["threshold"])
            .set(as_i64(stats.threshold_flushes));
        self.flushes
            .with_label_values(&["expiry"])
            .set(as_i64(stats.expiry_flushes));
        self.flushes
            .with_label_values(&["manual"])
            .set(as_i64(stats.manual_flushes));
        self.flush_failures.set(as_i64(stats.flush_failures));
        self.consistency_violations
            .set(as_i64(stats.consistency_violations));
        self.ignored_expirations.set(as_i64(stats.ignored_expirations));
        self.bytes_flushed.set(as_i64(stats.bytes_flushed));
    }
}

async fn run_metrics_server(addr: &str, store: Arc<WriteBackStore>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let gauges = Arc::new(
        StoreGauges::register()
            .map_err(|e| Error::Internal(format!("Metrics registration failed: {}", e)))?,
    );

    let make_svc = make_service_fn(move |_conn| {
        let store = store.clone();
        let gauges = gauges.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let store = store.clone();
                let gauges = gauges.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            gauges.update(&store.metrics());

                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&prometheus::gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(content_type) = encoder.format_type().parse() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, content_type);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
