//! Object Exporter Operator
//!
//! Watches ObjectExporter resources and exports fields of the objects they
//! select as Prometheus series.

use clap::Parser;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use kube::CustomResourceExt;
use prometheus::{Encoder, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use object_exporter_operator::kubernetes::{discover_types, run_discovery};
use object_exporter_operator::{
    Error, ExportReconciler, InstrumentRegistry, KubeClusterClient, ObjectExporter,
    OperatorMetrics, ReconcilerConfig, Resolver, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Object Exporter Operator - export Kubernetes object fields as Prometheus series
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Interval at which active exporters are reconciled again, in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "60")]
    resync_interval_secs: u64,

    /// API discovery interval in seconds
    #[arg(long, env = "DISCOVERY_INTERVAL", default_value = "300")]
    discovery_interval_secs: u64,

    /// Number of series listed in the exporter status
    #[arg(long, env = "STATUS_PREVIEW_LIMIT", default_value = "10")]
    preview_limit: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the ObjectExporter CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        let crd = serde_yaml::to_string(&ObjectExporter::crd())
            .map_err(|e| Error::Internal(format!("Failed to render CRD: {}", e)))?;
        print!("{}", crd);
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting Object Exporter Operator");
    info!("  Version: {}", object_exporter_operator::VERSION);
    info!("  Metrics: {}", args.metrics_addr);
    info!("  Workers: {}", args.workers);
    info!("  Resync interval: {}s", args.resync_interval_secs);

    let client = kube::Client::try_default().await?;
    let metrics = OperatorMetrics::new()?;
    let registry = Arc::new(InstrumentRegistry::new());
    let resolver = Resolver::default();

    // Built-in kinds stay resolvable when discovery fails
    match discover_types(&client).await {
        Ok(discovered) => resolver.refresh(discovered),
        Err(e) => warn!("Initial type discovery failed: {}", e),
    }
    metrics.set_known_kinds(resolver.known_kinds());
    info!("Resolver initialized with {} kinds", resolver.known_kinds());

    let config = ReconcilerConfig {
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_interval_secs.max(1)),
        preview_limit: args.preview_limit,
        ..Default::default()
    };
    let reconciler = Arc::new(ExportReconciler::new(
        Arc::new(KubeClusterClient::new(client.clone())),
        resolver.clone(),
        Arc::clone(&registry),
        metrics.clone(),
        config,
    ));
    let shutdown = reconciler.shutdown_token();

    // Periodic rediscovery picks up CRDs installed after startup
    tokio::spawn(run_discovery(
        client,
        resolver,
        metrics.clone(),
        Duration::from_secs(args.discovery_interval_secs.max(1)),
        shutdown.child_token(),
    ));

    let ready = Arc::new(AtomicBool::new(false));

    let health_addr = args.health_addr.clone();
    let health_ready = Arc::clone(&ready);
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    let server_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics, server_registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    let result = reconciler.run().await;
    ready.store(false, Ordering::SeqCst);

    info!("Operator shutdown complete");
    result
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?)
        .add_directive(directive("tower=warn")?);

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
    Ok(())
}

fn directive(raw: &str) -> Result<Directive> {
    raw.parse()
        .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", raw, e)))
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let addr = parse_addr(addr, "health")?;
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

/// Operator self metrics followed by every exported family
fn render_metrics(metrics: &OperatorMetrics, registry: &InstrumentRegistry) -> Response<Body> {
    let encoder = TextEncoder::new();
    let families = metrics.exposition(registry.families());

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return respond(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics");
    }

    let mut response = respond(StatusCode::OK, buffer);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

async fn run_metrics_server(
    addr: &str,
    metrics: OperatorMetrics,
    registry: Arc<InstrumentRegistry>,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        let registry = Arc::clone(&registry);
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = match req.uri().path() {
                    "/metrics" => render_metrics(&metrics, &registry),
                    _ => respond(StatusCode::NOT_FOUND, "not found"),
                };
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    let addr = parse_addr(addr, "metrics")?;
    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
