//! Consume watched-file notifications and schedule reduction jobs.
use std::future::ready;

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use health::{HealthRegistry, Heartbeat};
use run_detection::{
    app_context::AppContext,
    config::{Config, LogFormat},
    error::ServiceError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).with_filter(filter).boxed(),
        LogFormat::Json => fmt::layer()
            .with_target(true)
            .json()
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "run detection"
}

fn start_health_liveness_server(
    config: &Config,
    registry: HealthRegistry,
) -> Result<JoinHandle<()>, ServiceError> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(registry.get_status())));
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

async fn shutdown_signal() {
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(term) => term,
        Err(e) => {
            error!("failed to listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("failed to listen for ctrl-c: {}", e);
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = tokio::signal::ctrl_c() => {},
    };
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    let config = Config::init_from_env()?;
    setup_tracing(config.log_format);
    info!("Starting up...");

    let context = AppContext::new(&config).await?;
    let (registry, worker) = context.into_worker();

    start_health_liveness_server(&config, registry.clone())?;
    Heartbeat::new(&config.heartbeat_path, config.heartbeat_interval.0).spawn(registry);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutting down");
            shutdown.cancel();
        }
    });

    // Returns once in-flight messages are settled or the drain timeout passed
    worker.run(shutdown).await;

    Ok(())
}
