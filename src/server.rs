//! HTTP surface: the terminal WebSocket endpoint and a health probe.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::terminal::{Bridge, ExecTarget, WsTerminalSession};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub bridge: Arc<Bridge>,
}

/// Pod coordinates from the upgrade request's query string
#[derive(Debug, Default, Deserialize)]
pub struct TerminalQuery {
    #[serde(default)]
    pub namespace: String,
    #[serde(default, rename = "podName")]
    pub pod_name: String,
    #[serde(default, rename = "containerName")]
    pub container_name: String,
}

impl From<TerminalQuery> for ExecTarget {
    fn from(query: TerminalQuery) -> Self {
        ExecTarget::new(query.namespace, query.pod_name, query.container_name)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(config: &AppConfig, bridge: Arc<Bridge>) -> Router {
    let terminal = Router::new().route(&config.terminal_path, get(terminal_handler));
    with_handshake_timeout(terminal, config.handshake_timeout())
        .route("/healthz", get(health_handler))
        .with_state(AppState { bridge })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bound the routes registered so far by `timeout`.
///
/// Covers extraction and the handler up to the `101` response. Reading the
/// request head happens before routing and the upgraded socket is served
/// after the response, so neither counts against it. Expiry answers `408`.
fn with_handshake_timeout<S>(router: Router<S>, timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.route_layer(TimeoutLayer::new(timeout))
}

/// Terminal WebSocket upgrade handler.
///
/// Rejected upgrades answer with a bare status and never create a session.
async fn terminal_handler(
    State(state): State<AppState>,
    query: Result<Query<TerminalQuery>, QueryRejection>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Terminal upgrade rejected");
            return rejection.status().into_response();
        }
    };
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "Terminal query rejected");
            return rejection.status().into_response();
        }
    };

    let target = ExecTarget::from(query);
    tracing::info!(%target, "Terminal upgrade requested");

    ws.on_failed_upgrade(|e| tracing::warn!(error = %e, "Terminal upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, state.bridge, target))
}

async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>, target: ExecTarget) {
    let session = Arc::new(WsTerminalSession::new(socket));
    let outcome = bridge.run(session, target).await;
    tracing::debug!(?outcome, "Terminal session finished");
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// A bound, not yet running server
pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    pub async fn bind(config: &AppConfig, bridge: Arc<Bridge>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.listen_addr.clone(),
                source,
            })?;
        Ok(Self {
            listener,
            router: build_router(config, bridge),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = self.local_addr()?;
        tracing::info!(%local_addr, "Terminal server started");
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("Terminal server stopped");
        Ok(())
    }
}

/// Bind `config.listen_addr` and serve until `shutdown` resolves.
pub async fn serve<F>(
    config: &AppConfig,
    bridge: Arc<Bridge>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    Server::bind(config, bridge).await?.run(shutdown).await
}
