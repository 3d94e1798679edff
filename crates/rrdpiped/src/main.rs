mod access_log;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use tokio::sync::{Semaphore, watch};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use rrdpipe_core::ReportingConfig;
use rrdpipe_core::ingest::IngestionServer;
use rrdpipe_core::router::SubscriptionRouter;
use rrdpipe_core::service::ReportingService;

use access_log::AccessLogLayer;
use openapi::ApiDoc;
use state::{AppInner, SharedState};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(
    name = "rrdpiped",
    about = "collectd archive reporting daemon",
    version = rrdpipe_core::VERSION
)]
struct Args {
    /// Path to a JSON reporting config. Defaults apply when omitted.
    #[arg(long, env = "RRDPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP API listen address.
    #[arg(long, default_value = "127.0.0.1:8080", env = "RRDPIPE_LISTEN")]
    listen: String,

    /// Graphite line-protocol listen address.
    #[arg(long, default_value = "127.0.0.1:2003", env = "RRDPIPE_GRAPHITE")]
    graphite: String,

    /// Override the archive root from the config.
    #[arg(long, env = "RRDPIPE_ARCHIVE_ROOT")]
    archive_root: Option<PathBuf>,

    /// Path to /proc filesystem.
    #[arg(long, default_value = "/proc")]
    proc_path: PathBuf,

    /// Path to /sys filesystem.
    #[arg(long, default_value = "/sys")]
    sys_path: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

// ============================================================
// Main
// ============================================================

/// Initializes the tracing subscriber with the appropriate log level.
/// `RUST_LOG` directives apply on top.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["rrdpiped", "rrdpipe_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(args)) {
        error!(error = %e, "rrdpiped stopped");
        process::exit(1);
    }
}

fn load_config(args: &Args) -> rrdpipe_core::Result<ReportingConfig> {
    let mut config = match &args.config {
        Some(path) => ReportingConfig::load(path)?,
        None => ReportingConfig::default(),
    };
    if let Some(root) = &args.archive_root {
        config.archive_root = root.clone();
    }
    Ok(config)
}

async fn async_main(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = rrdpipe_core::VERSION, "starting");

    let config = load_config(&args)?;
    info!(
        archive_root = %config.archive_root.display(),
        step = config.step,
        max_concurrent_queries = config.max_concurrent_queries,
        "config loaded"
    );

    let limiter = Arc::new(Semaphore::new(config.max_concurrent_queries.max(1)));
    let service = ReportingService::from_config(config)?.with_proc_root(&args.proc_path);
    info!(plugins = service.registry().len(), "plugins registered");

    let router = Arc::new(SubscriptionRouter::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Ingestion
    let graphite = IngestionServer::bind(&args.graphite).await?;
    let ingestion = Arc::new(IngestionServer::new(Arc::clone(&router)));
    let ingestion_task = tokio::spawn(async move {
        if let Err(e) = ingestion.serve(graphite).await {
            error!(error = %e, "ingestion listener failed");
        }
    });

    let state: SharedState = Arc::new(AppInner {
        service: Arc::new(service),
        router,
        limiter,
        proc_root: args.proc_path.clone(),
        sys_root: args.sys_path.clone(),
        shutdown: shutdown_rx,
    });

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = args.listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received, shutting down");
            shutdown_tx.send_replace(true);
        })
        .await;

    ingestion_task.abort();
    served?;
    info!("shutdown complete");
    Ok(())
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/config", get(handlers::handle_config))
        .route("/api/v1/graphs", get(handlers::handle_graphs))
        .route("/api/v1/data", post(handlers::handle_data))
        .route("/api/v1/stream", get(handlers::handle_stream))
        .route("/api/v1/realtime", get(handlers::handle_realtime))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}
