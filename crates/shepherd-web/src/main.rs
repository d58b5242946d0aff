mod access_log;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use shepherd_core::aggregator::{AggregatorConfig, DEFAULT_CAPACITY};
use shepherd_core::hub::{DEFAULT_QUEUE_CAPACITY, HubConfig, OverflowPolicy};
use shepherd_core::listener::{DEFAULT_INGEST_ADDR, DEFAULT_MAX_LINE_BYTES, IngestListener};
use shepherd_core::parser::ParserConfig;
use shepherd_core::pipeline::{Pipeline, PipelineConfig};

use access_log::AccessLogLayer;
use openapi::ApiDoc;
use state::{AppState, DEFAULT_PING_INTERVAL};

// ============================================================
// CLI
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "shepherd-web", about = "shepherd log collector and API server", version)]
struct Args {
    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8000", env = "SHEPHERD_LISTEN")]
    listen: String,

    /// Address agents connect to.
    #[arg(long, default_value = DEFAULT_INGEST_ADDR, env = "SHEPHERD_INGEST")]
    ingest: String,

    /// Number of recent records kept in memory.
    #[arg(long, default_value_t = DEFAULT_CAPACITY, env = "SHEPHERD_CAPACITY")]
    capacity: usize,

    /// Outbound queue size per push client.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// What to do with a push client whose queue is full: drop-oldest or disconnect.
    #[arg(long, default_value_t = OverflowPolicy::DropOldest)]
    overflow: OverflowPolicy,

    /// Token that marks an unparsable line as an error (case-insensitive, repeatable).
    /// Defaults to error, fatal, critical, exception, panic.
    #[arg(long = "error-marker", value_name = "TOKEN")]
    error_markers: Vec<String>,

    /// Keep-alive interval on push channels, in seconds.
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL.as_secs())]
    ping_secs: u64,

    /// Longest accepted log line in bytes; longer lines are discarded.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_BYTES)]
    max_line_bytes: usize,
}

impl Args {
    fn pipeline_config(&self) -> PipelineConfig {
        let parser = if self.error_markers.is_empty() {
            ParserConfig::default()
        } else {
            ParserConfig {
                error_markers: self.error_markers.clone(),
            }
        };
        PipelineConfig {
            parser,
            aggregator: AggregatorConfig {
                capacity: self.capacity,
            },
            hub: HubConfig {
                queue_capacity: self.queue_capacity,
                overflow: self.overflow,
            },
        }
    }
}

// ============================================================
// Main
// ============================================================

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shepherd_web=info,shepherd_core=info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(async_main(args))
}

pub(crate) fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::handle_info))
        .route("/health", get(handlers::handle_health_check))
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/logs", post(handlers::handle_ingest))
        .route("/stats", get(handlers::handle_stats))
        .route("/logs", get(handlers::handle_logs))
        .route("/acknowledge", post(handlers::handle_acknowledge))
        .route("/ws", get(handlers::handle_ws))
        .route("/api/v1/stream", get(handlers::handle_stream))
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
}

async fn async_main(args: Args) -> ExitCode {
    let config = args.pipeline_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        capacity = config.aggregator.capacity,
        queue_capacity = config.hub.queue_capacity,
        overflow = %config.hub.overflow,
        "starting collector"
    );
    let pipeline = Pipeline::shared(&config);

    let ingest = match IngestListener::bind(&args.ingest, pipeline.clone()).await {
        Ok(listener) => listener.with_max_line_bytes(args.max_line_bytes),
        Err(e) => {
            error!(error = %e, "cannot start ingest listener");
            return ExitCode::FAILURE;
        }
    };
    let cancel = CancellationToken::new();
    let ingest_task = tokio::spawn(ingest.run(cancel.clone()));

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, "listening");

    let state = AppState::new(pipeline.clone(), Duration::from_secs(args.ping_secs))
        .with_max_line_bytes(args.max_line_bytes);
    let app = app(state).into_make_service_with_connect_info::<SocketAddr>();

    let shutdown = {
        let cancel = cancel.clone();
        let pipeline = pipeline.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            // Stop ingesting first, then release push clients.
            cancel.cancel();
            if let Err(e) = ingest_task.await {
                warn!(error = %e, "ingest listener task failed");
            }
            pipeline.shutdown();
        }
    };

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    cancel.cancel();
    pipeline.shutdown();

    match result {
        Ok(()) => {
            let stats = pipeline.stats();
            info!(
                total = stats.total_count,
                errors = stats.error_count,
                "collector stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["shepherd-web"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:8000");
        assert_eq!(args.ingest, "0.0.0.0:9999");
        assert_eq!(args.ping_secs, 10);
        assert_eq!(args.max_line_bytes, 64 * 1024);

        let config = args.pipeline_config();
        assert_eq!(config.aggregator.capacity, 100);
        assert_eq!(config.hub.queue_capacity, 256);
        assert_eq!(config.hub.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.parser.error_markers.len(), 5);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::try_parse_from([
            "shepherd-web",
            "--capacity",
            "5",
            "--overflow",
            "disconnect",
            "--error-marker",
            "oops",
            "--error-marker",
            "boom",
        ])
        .unwrap();
        let config = args.pipeline_config();
        assert_eq!(config.aggregator.capacity, 5);
        assert_eq!(config.hub.overflow, OverflowPolicy::Disconnect);
        assert_eq!(config.parser.error_markers, vec!["oops", "boom"]);

        assert!(Args::try_parse_from(["shepherd-web", "--overflow", "block"]).is_err());
    }
}
