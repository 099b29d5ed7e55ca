pub mod monitoring;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus_client::encoding::text::encode;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::command::{self, Command, CommandError, Envelope};
use crate::state::AppState;
use crate::store::TargetStore;
use monitoring::{
    CommandLabels, ReconcileMetrics, ServerMetrics, RECONCILE_METRICS, SERVER_METRICS,
};

async fn health_handler() -> &'static str {
    "Healthy"
}

async fn expose_metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    let mut buffer = String::new();
    let registry = state.registry.read().await;
    encode(&mut buffer, &registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(buffer)
}

/// `/health` and `/metrics`, mounted by both binaries.
pub fn ops_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(expose_metrics))
        .with_state(state)
}

/// Registers the reconcile metrics and build info for the sync client.
pub async fn register_client_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    RECONCILE_METRICS
        .get_or_init(|| async { ReconcileMetrics::register(&mut registry, "reconcile") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "feature_sync", state.service);
}

/// Registers the command metrics and build info for the command server.
pub async fn register_server_metrics(state: &AppState) {
    let mut registry = state.registry.write().await;
    SERVER_METRICS
        .get_or_init(|| async { ServerMetrics::register(&mut registry, "server") })
        .await;
    monitoring::register_build_info_metric(&mut registry, "feature_sync", state.service);
}

/// The target's command channel. Every answer is HTTP 200 with a `{code, desc, data}`
/// envelope; failures are reported through `code`.
pub fn command_router(store: Arc<dyn TargetStore>) -> Router {
    Router::new()
        .route("/feature", get(handle_get).post(handle_post))
        .with_state(store)
}

async fn handle_get(
    State(store): State<Arc<dyn TargetStore>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Envelope> {
    respond(store.as_ref(), Command::from_query(params)).await
}

async fn handle_post(State(store): State<Arc<dyn TargetStore>>, body: Bytes) -> Json<Envelope> {
    let parsed = serde_json::from_slice::<Value>(&body)
        .map_err(|err| CommandError::InvalidParameter {
            name: "body".to_string(),
            message: err.to_string(),
        })
        .and_then(Command::from_body);
    respond(store.as_ref(), parsed).await
}

async fn respond(store: &dyn TargetStore, parsed: Result<Command, CommandError>) -> Json<Envelope> {
    let (label, envelope) = match parsed {
        Ok(command) => {
            let name = command.kind().name();
            debug!(event = "command_received", command = %name);
            (name, command::execute(store, command).await)
        }
        Err(err) => {
            let label = match err {
                CommandError::Unsupported(_) => "unsupported",
                _ => "invalid",
            };
            (label.to_string(), Envelope::from(err))
        }
    };

    if !envelope.is_ok() {
        warn!(
            event = "command_failed",
            command = %label,
            code = envelope.code,
            desc = %envelope.desc,
        );
    }
    if let Some(metrics) = SERVER_METRICS.get() {
        let family = if envelope.is_ok() {
            &metrics.commands_served_total
        } else {
            &metrics.commands_failed_total
        };
        family.get_or_create(&CommandLabels { command: label }).inc();
    }
    Json(envelope)
}

/// Binds `addr` and serves `app` until `shutdown_token` fires. Returns the bound address,
/// which differs from `addr` when port 0 was requested.
pub async fn serve(
    app: Router,
    addr: SocketAddr,
    shutdown_token: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
        })
        .await;
        if let Err(err) = result {
            error!(event = "http_server_failed", error = %err, "HTTP server stopped with an error");
        }
    });

    Ok((local_addr, server_handle))
}
