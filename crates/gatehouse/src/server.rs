//! Axum HTTP server: admin routes, the proxy pipeline, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::auth::{Gate, Verdict};
use crate::config::ProxyConfig;
use crate::error::ConfigError;
use crate::proxy::correlation;
use crate::proxy::target::normalize_path_and_query;
use crate::proxy::{Dispatcher, TargetList};
use crate::stats::ProxyStats;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    /// `None` when authorization is disabled.
    pub gate: Option<Gate>,
    pub dispatcher: Dispatcher,
    pub stats: ProxyStats,
}

impl AppState {
    /// Build the pipeline described by `config`. Every configuration
    /// problem surfaces here, before the listener is bound.
    pub fn from_config(config: ProxyConfig) -> Result<Self, ConfigError> {
        let targets = TargetList::parse(&config.backends.targets)?;

        // Redirects are relayed to the caller, never followed.
        let mut backend_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.backends.connect_timeout_secs))
            .redirect(reqwest::redirect::Policy::none());
        if let Some(secs) = config.backends.timeout_secs {
            backend_client = backend_client.timeout(Duration::from_secs(secs));
        }
        let dispatcher = Dispatcher::new(targets, backend_client.build()?);

        let gate = Gate::from_config(&config.auth)?;

        Ok(Self {
            config,
            gate,
            dispatcher,
            stats: ProxyStats::new(),
        })
    }
}

/// Assemble the router: admin routes under the admin prefix, everything
/// else through the proxy pipeline. The stats route is bound only when
/// `server.expose_stats` is set; otherwise its path is proxied like any other.
pub fn router(state: AppState) -> Router {
    let prefix = state.config.server.admin_prefix.clone();

    let mut router: Router<Arc<AppState>> =
        Router::new().route(&format!("{prefix}/health"), get(handle_health));
    if state.config.server.expose_stats {
        router = router.route(&format!("{prefix}/stats"), get(handle_get_stats));
    }

    router
        .fallback(handle_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Build and run the HTTP server.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "gatehouse listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("gatehouse shut down gracefully");
    Ok(())
}

/// The request-dispatch pipeline, for every request outside the admin prefix.
///
/// 1. Generate correlation ID
/// 2. Resolve dot segments so the gate and the backend see one path
/// 3. Authorization gate (if enabled); deny short-circuits with 403
/// 4. Select the next backend round-robin
/// 5. Forward and stream the backend response back
async fn handle_proxy(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = correlation::generate_id();
    let span =
        gatehouse_tracing::proxy_request_span!(&request_id, request.method(), request.uri().path());

    state.stats.inc_requests();

    async move {
        let (mut parts, body) = request.into_parts();

        // The gate and the backend must see the same path.
        let raw = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let Some(normalized) = normalize_path_and_query(raw) else {
            tracing::Span::current().record("status", StatusCode::BAD_REQUEST.as_u16());
            tracing::warn!(
                path = %raw,
                "Rejected request target that is not an origin-form path"
            );
            return (StatusCode::BAD_REQUEST, "Bad Request.").into_response();
        };
        if normalized.path() != parts.uri.path() {
            tracing::debug!(
                raw = %raw,
                normalized = %normalized,
                "Resolved dot segments in request path"
            );
        }
        parts.uri = normalized;

        if let Some(gate) = &state.gate {
            match gate.check(&parts, &request_id).await {
                Verdict::Allowed => {
                    tracing::Span::current().record("verdict", "allowed");
                    state.stats.inc_allowed();
                }
                Verdict::Denied(reason) => {
                    tracing::Span::current().record("verdict", "denied");
                    tracing::Span::current().record("status", StatusCode::FORBIDDEN.as_u16());
                    state.stats.inc_denied();
                    tracing::warn!(reason = %reason, "Authorization check failed");
                    return (StatusCode::FORBIDDEN, "Forbidden.").into_response();
                }
            }
        }

        let target = state.dispatcher.select_target();
        let request = Request::from_parts(parts, body);

        match state.dispatcher.forward(request, target, &request_id).await {
            Ok(response) => {
                tracing::Span::current().record("status", response.status().as_u16());
                state.stats.inc_forwarded();
                response
            }
            Err(e) => {
                let status = e.status_code();
                tracing::Span::current().record("status", status.as_u16());
                state.stats.inc_backend_errors();
                tracing::error!(backend = %e.target(), error = %e, "Error contacting backend");
                (status, format!("Error contacting backend: {e}")).into_response()
            }
        }
    }
    .instrument(span)
    .await
}

/// GET {admin_prefix}/stats: counters plus the configured targets.
async fn handle_get_stats(State(state): State<Arc<AppState>>) -> Response {
    let targets: Vec<String> = state
        .dispatcher
        .targets()
        .as_slice()
        .iter()
        .map(|t| t.to_string())
        .collect();
    axum::Json(serde_json::json!({
        "stats": state.stats.snapshot(),
        "targets": targets,
        "auth": state.gate.is_some(),
    }))
    .into_response()
}

/// Liveness of the proxy itself; says nothing about backends.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
