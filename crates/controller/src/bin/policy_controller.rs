/*
 * 5D Labs Agent Platform - RollbackPolicy Remediation Controller
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Policy Controller Service
//!
//! Runs the `RollbackPolicy` reconcile loop and serves:
//! - `/health` and `/ready` probes
//! - `/metrics` with the controller counters as JSON
//! - `/validate` for the validating admission webhook

use anyhow::Context as _;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::Parser;
use controller::admission;
use controller::config::{ControllerConfig, DEFAULT_CONFIG_PATH};
use controller::crds::RollbackPolicy;
use controller::executor::KubeTargetClient;
use controller::metrics::MetricsSnapshot;
use controller::source::{
    KubeStatusSource, MetricSource, NoMetrics, PrometheusConfig, PrometheusSource,
};
use controller::store::KubePolicyStore;
use controller::{run_policy_controller, Context};
use kube::core::admission::AdmissionReview;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Closed-loop remediation controller for RollbackPolicy resources
#[derive(Parser)]
#[command(name = "policy-controller")]
#[command(version)]
struct Cli {
    /// Namespace to watch (all namespaces when omitted)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Path to the controller configuration file
    #[arg(long, env = "CONTROLLER_CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// HTTP bind address, overriding `server.bindAddress`
    #[arg(long)]
    bind: Option<String>,
}

type AppState = Arc<Context>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!(
        "Starting RollbackPolicy controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config(&cli.config);
    config.validate().context("invalid controller configuration")?;
    let bind = cli
        .bind
        .clone()
        .unwrap_or_else(|| config.server.bind_address.clone());

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let prometheus = PrometheusConfig::from_metrics_config(&config.metrics);
    let metric_source: Arc<dyn MetricSource> = match prometheus {
        Some(prometheus) => {
            info!(url = %prometheus.base_url, "Using Prometheus metric source");
            let source = PrometheusSource::new(prometheus)
                .context("failed to build Prometheus client")?;
            Arc::new(source)
        }
        None => {
            warn!("No metrics backend configured, metric guards will report missing samples");
            Arc::new(NoMetrics)
        }
    };

    let ctx = Arc::new(Context::new(
        Arc::new(KubePolicyStore::new(client.clone(), cli.namespace.clone())),
        Arc::new(KubeStatusSource::new(client.clone())),
        metric_source,
        Arc::new(KubeTargetClient::new(client)),
        notify::Notifier::from_env(),
        config,
    ));

    let shutdown = CancellationToken::new();
    let controller_handle = tokio::spawn({
        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = run_policy_controller(ctx, shutdown).await {
                error!("Controller error: {}", e);
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/validate", post(validate))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(ctx);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("Controller HTTP server listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = controller_handle.await {
        error!("Controller task panicked: {}", e);
    }
    info!("Controller service stopped");

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,controller=debug".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_controller_config(config_path: &str) -> ControllerConfig {
    if !Path::new(config_path).exists() {
        warn!("No configuration at {}. Using defaults.", config_path);
        return ControllerConfig::default();
    }

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "policy-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(ctx): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !ctx.is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "policy-controller",
        "trackedPolicies": ctx.scheduler.len(),
        "inFlightActions": ctx.executor.in_flight()
    })))
}

async fn metrics(State(ctx): State<AppState>) -> Json<MetricsSnapshot> {
    Json(ctx.metrics.snapshot())
}

async fn validate(
    State(ctx): State<AppState>,
    Json(review): Json<AdmissionReview<RollbackPolicy>>,
) -> Json<AdmissionReview<DynamicObject>> {
    Json(admission::admit(review, ctx.store.as_ref(), ctx.executor.handlers()).await)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
