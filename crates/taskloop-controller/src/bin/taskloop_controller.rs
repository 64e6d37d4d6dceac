/*
 * 5D Labs Agent Platform - TaskLoop Controller
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

//! TaskLoop Controller Service
//!
//! - Watches Tekton `Run` resources that reference a `TaskLoop`
//! - Creates one `TaskRun` per iteration and tracks them to completion
//! - Serves health and readiness endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskloop_controller::tasks::config::{ControllerConfig, LogFormat};
use taskloop_controller::tasks::run_task_loop_controller;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    controller_running: Arc<AtomicBool>,
}

fn init_tracing(config: &ControllerConfig) {
    let json = config.logging.format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.clone().into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, config_source) = ControllerConfig::load()?;
    init_tracing(&config);
    config_source.log();
    let config = Arc::new(config);

    info!(
        "Starting TaskLoop Controller Service v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let controller_running = Arc::new(AtomicBool::new(true));

    // Start the controller in the background
    let controller_handle = {
        let client = client.clone();
        let config = config.clone();
        let running = controller_running.clone();
        tokio::spawn(async move {
            if let Err(e) = run_task_loop_controller(client, config).await {
                error!("Controller error: {}", e);
            }
            running.store(false, Ordering::SeqCst);
        })
    };

    let state = AppState { controller_running };

    let bind_address = config.server.bind_address.clone();
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Controller HTTP server listening on {}", bind_address);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller_handle.abort();
    info!("Controller service stopped");

    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    Duration::from_secs(60),
                )),
        )
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "taskloop-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.controller_running.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "taskloop-controller",
        "version": env!("CARGO_PKG_VERSION")
    })))
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
