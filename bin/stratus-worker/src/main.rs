//! Stratus Worker - tiered block storage daemon
//!
//! This binary opens the tiered block store, runs session expiry and space
//! reservation in the background, and serves metrics, health, reports and
//! session heartbeats over HTTP.

mod service;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use service::WorkerService;
use std::net::SocketAddr;
use std::sync::Arc;
use stratus_common::{
    AllocatorKind, EvictorKind, SessionId, StoreConfig, WorkerRange, WorkerReportOptions,
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stratus-worker")]
#[command(about = "Stratus tiered block storage worker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/stratus/worker.toml")]
    config: String,

    /// Worker id reported to clients
    #[arg(long, env = "STRATUS_WORKER_ID")]
    worker_id: Option<u64>,

    /// Address this worker is known by in reports
    #[arg(long)]
    address: Option<String>,

    /// Allocation policy (max_free, greedy, round_robin)
    #[arg(long)]
    allocator: Option<AllocatorKind>,

    /// Eviction policy (lru, greedy)
    #[arg(long)]
    evictor: Option<EvictorKind>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// HTTP port for metrics, health and reports
    #[arg(long, default_value = "29996")]
    metrics_port: u16,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    worker: WorkerConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct WorkerConfig {
    #[serde(default)]
    id: u64,
    #[serde(default = "default_address")]
    address: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            address: default_address(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_address() -> String {
    "localhost:29999".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Settings after merging the config file with CLI args
#[derive(Debug)]
struct Settings {
    worker_id: u64,
    address: String,
    log_level: String,
    store: StoreConfig,
}

impl Settings {
    /// CLI args take precedence over the config file
    fn merge(args: &Args, config: Config) -> Self {
        let mut store = config.store;
        if let Some(allocator) = args.allocator {
            store.allocation.policy = allocator;
        }
        if let Some(evictor) = args.evictor {
            store.eviction.policy = evictor;
        }
        let log_level = if args.log_level == "info" {
            config.logging.level
        } else {
            args.log_level.clone()
        };

        Self {
            worker_id: args.worker_id.unwrap_or(config.worker.id),
            address: args.address.clone().unwrap_or(config.worker.address),
            log_level,
            store,
        }
    }
}

fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&config_str)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let config = load_config(&args.config)?;
    let settings = Settings::merge(&args, config);

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stratus worker");
    info!("Config file: {}", args.config);
    for tier in &settings.store.tiers {
        let dirs: Vec<_> = tier.dirs.iter().map(|d| d.path.display().to_string()).collect();
        info!(
            "Tier {}: {} bytes in {:?}, {} bytes reserved",
            tier.alias,
            tier.capacity_bytes(),
            dirs,
            tier.reserved_bytes
        );
    }
    info!(
        "Allocator: {}, evictor: {}",
        settings.store.allocation.policy, settings.store.eviction.policy
    );

    let sweep_interval = settings.store.session.sweep_interval();
    let reserver_interval = settings.store.reserver.interval();
    let reserver_enabled = settings.store.reserver.enabled;

    // Opening the store scans every dir, so keep it off the runtime threads
    let service = tokio::task::spawn_blocking(move || {
        WorkerService::new(settings.worker_id, settings.address, settings.store)
    })
    .await?;
    let service = match service {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to open block store: {}", e);
            std::process::exit(1);
        }
    };

    let status = service.status();
    info!(
        "Worker {} recovered {} blocks, {} of {} bytes used",
        status.worker_id, status.block_count, status.used_bytes, status.capacity_bytes
    );

    // Background tasks
    let sweeper_handle = tokio::spawn(service::run_session_sweeper(
        Arc::clone(&service),
        sweep_interval,
    ));
    let reserver_handle = reserver_enabled.then(|| {
        tokio::spawn(service::run_space_reserver(
            Arc::clone(&service),
            reserver_interval,
        ))
    });

    info!(
        "Metrics available at http://0.0.0.0:{}/metrics",
        args.metrics_port
    );
    start_http_server(args.metrics_port, Arc::clone(&service)).await?;

    sweeper_handle.abort();
    if let Some(handle) = reserver_handle {
        handle.abort();
    }

    let stats = service.store().stats().snapshot();
    info!(
        "Worker shut down gracefully: {} blocks committed, {} evicted, {} demoted",
        stats.blocks_committed, stats.blocks_evicted, stats.blocks_demoted
    );

    Ok(())
}

fn router(service: Arc<WorkerService>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/report", get(report_handler))
        .route("/sessions/{id}/heartbeat", post(heartbeat_handler))
        .route("/sessions/{id}/close", post(close_session_handler))
        .with_state(service)
}

/// Start the HTTP server, returning on ctrl-c
async fn start_http_server(port: u16, service: Arc<WorkerService>) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    Ok(())
}

/// Metrics HTTP handler
async fn metrics_handler(State(service): State<Arc<WorkerService>>) -> impl IntoResponse {
    match service.export_prometheus() {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Health check handler
async fn health_handler(State(service): State<Arc<WorkerService>>) -> impl IntoResponse {
    match service.store().check_accounting() {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!("Store accounting check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, format!("UNHEALTHY: {e}"))
        }
    }
}

/// Query of a report request, using the wire names of fields and ranges
#[derive(Debug, Default, Deserialize)]
struct ReportQuery {
    /// Comma separated field names; all fields when absent
    fields: Option<String>,
    /// ALL, LIVE, LOST or SPECIFIED
    range: Option<WorkerRange>,
    /// Comma separated worker addresses for SPECIFIED
    addresses: Option<String>,
}

impl ReportQuery {
    fn options(&self) -> stratus_common::Result<WorkerReportOptions> {
        let mut options = WorkerReportOptions::default();
        if let Some(fields) = &self.fields {
            options = options.with_field_range(WorkerReportOptions::parse_field_range(fields)?);
        }
        if let Some(range) = self.range {
            options = options.with_worker_range(range);
        }
        if let Some(addresses) = &self.addresses {
            options = options.with_addresses(
                addresses
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(options)
    }
}

/// Worker report handler
async fn report_handler(
    State(service): State<Arc<WorkerService>>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let report = query.options().and_then(|options| service.report(&options));
    match report {
        Ok(Some(worker)) => (StatusCode::OK, Json(json!({ "workers": [worker] }))),
        Ok(None) => (StatusCode::OK, Json(json!({ "workers": [] }))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Session heartbeat handler
async fn heartbeat_handler(
    State(service): State<Arc<WorkerService>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match service.heartbeat(SessionId::new(id)) {
        Ok(()) => (StatusCode::NO_CONTENT, String::new()),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Close a session and release everything it holds
async fn close_session_handler(
    State(service): State<Arc<WorkerService>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    let session_id = SessionId::new(id);
    let svc = Arc::clone(&service);
    match tokio::task::spawn_blocking(move || svc.close_session(session_id)).await {
        Ok(Ok(())) => (StatusCode::NO_CONTENT, String::new()),
        Ok(Err(e)) if e.is_fatal() => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Ok(Err(e)) => (StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use stratus_common::{DirConfig, TierConfig};
    use tempfile::tempdir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["stratus-worker"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    fn test_service(root: &std::path::Path) -> Arc<WorkerService> {
        let store = StoreConfig {
            tiers: vec![TierConfig {
                alias: "MEM".to_string(),
                dirs: vec![DirConfig {
                    path: root.join("mem0"),
                    capacity_bytes: 1000,
                }],
                reserved_bytes: 0,
            }],
            ..StoreConfig::default()
        };
        Arc::new(WorkerService::new(1, "worker-1:29999".to_string(), store).unwrap())
    }

    #[test]
    fn test_config_file_parsing() {
        let config: Config = toml::from_str(
            r#"
            [worker]
            id = 12
            address = "w12:29999"

            [logging]
            level = "debug"

            [[store.tiers]]
            alias = "MEM"
            reserved_bytes = 100
            dirs = [{ path = "/mnt/ramdisk", capacity_bytes = 1000 }]

            [[store.tiers]]
            alias = "HDD"
            dirs = [
                { path = "/data/hdd0", capacity_bytes = 100000 },
                { path = "/data/hdd1", capacity_bytes = 100000 },
            ]

            [store.eviction]
            policy = "greedy"
            cascade = true
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.id, 12);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.store.tiers.len(), 2);
        assert_eq!(config.store.tiers[0].reserved_bytes, 100);
        assert_eq!(config.store.tiers[1].capacity_bytes(), 200_000);
        assert_eq!(config.store.eviction.policy, EvictorKind::Greedy);
        assert!(config.store.eviction.cascade);
        assert!(config.store.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.worker.address, "localhost:29999");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.store.tiers.len(), 1);
    }

    #[test]
    fn test_cli_overrides_config() {
        let config: Config = toml::from_str(
            r#"
            [worker]
            id = 3
            address = "from-file:1"
            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let settings = Settings::merge(
            &args(&[
                "--worker-id",
                "9",
                "--allocator",
                "round_robin",
                "--evictor",
                "greedy",
                "--log-level",
                "debug",
            ]),
            config,
        );
        assert_eq!(settings.worker_id, 9);
        assert_eq!(settings.address, "from-file:1");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.store.allocation.policy, AllocatorKind::RoundRobin);
        assert_eq!(settings.store.eviction.policy, EvictorKind::Greedy);
    }

    #[test]
    fn test_default_log_level_defers_to_file() {
        let config: Config = toml::from_str("[logging]\nlevel = \"trace\"").unwrap();
        let settings = Settings::merge(&args(&[]), config);
        assert_eq!(settings.log_level, "trace");
    }

    #[test]
    fn test_report_query() {
        let query = ReportQuery {
            fields: Some("ADDRESS, USED_BYTES".to_string()),
            range: Some(WorkerRange::Specified),
            addresses: Some("a:1,b:2".to_string()),
        };
        let options = query.options().unwrap();
        assert_eq!(options.field_range.len(), 2);
        assert_eq!(options.worker_range, WorkerRange::Specified);
        assert_eq!(options.addresses.len(), 2);

        let bad = ReportQuery {
            fields: Some("DISK_SERIAL".to_string()),
            ..ReportQuery::default()
        };
        assert!(bad.options().is_err());
    }

    #[tokio::test]
    async fn test_report_handler() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());

        let query = ReportQuery {
            fields: Some("ADDRESS,CAPACITY_BYTES".to_string()),
            ..ReportQuery::default()
        };
        let response = report_handler(State(Arc::clone(&service)), Query(query))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["workers"][0]["ADDRESS"], "worker-1:29999");
        assert_eq!(value["workers"][0]["CAPACITY_BYTES"], 1000);
    }

    #[tokio::test]
    async fn test_session_handlers() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());

        let response = heartbeat_handler(State(Arc::clone(&service)), Path(42))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(service.sessions().contains(SessionId::new(42)));

        let response = close_session_handler(State(Arc::clone(&service)), Path(42))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!service.sessions().contains(SessionId::new(42)));

        let response = heartbeat_handler(
            State(Arc::clone(&service)),
            Path(SessionId::EVICTOR.as_u64()),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());
        let response = health_handler(State(service)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_handler_under_writes() {
        let dir = tempdir().unwrap();
        let service = test_service(dir.path());

        let writer = {
            let service = Arc::clone(&service);
            tokio::task::spawn_blocking(move || {
                let store = service.store();
                let session = SessionId::new(8);
                for id in 0..200u64 {
                    let block = stratus_common::BlockId::new(id);
                    store
                        .create_block(session, block, &stratus_common::BlockStoreLocation::any_tier(), 4)
                        .unwrap();
                    store.write_block(session, block, 0, b"data").unwrap();
                    store.commit_block(session, block).unwrap();
                    store.remove_block(session, block).unwrap();
                }
            })
        };

        while !writer.is_finished() {
            let response = health_handler(State(Arc::clone(&service))).await.into_response();
            assert_eq!(response.status(), StatusCode::OK);
        }
        writer.await.unwrap();
    }
}
