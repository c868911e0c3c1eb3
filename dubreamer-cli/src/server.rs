//! `GET /health` behind HTTP basic auth.

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use dubreamer_engine::{HealthReport, StreamSupervisor};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const REALM: &str = "Basic realm=\"dubreamer\"";

pub fn router(supervisor: Arc<StreamSupervisor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(supervisor.clone(), basic_auth))
        .with_state(supervisor)
}

async fn health(State(supervisor): State<Arc<StreamSupervisor>>) -> Json<HealthReport> {
    Json(supervisor.health().await)
}

fn decode_basic(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Credentials come from the active configuration on every request, so a
/// reload takes effect without restarting the listener.
async fn basic_auth(
    State(supervisor): State<Arc<StreamSupervisor>>,
    request: Request,
    next: Next,
) -> Response {
    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(decode_basic);

    let config = supervisor.active_config();
    match credentials {
        Some((user, pass)) if user == config.auth.username && pass == config.auth.password => {
            next.run(request).await
        }
        Some((user, _)) => {
            tracing::warn!(user = %user, "Rejected status request with bad credentials");
            unauthorized()
        }
        None => {
            tracing::warn!("Status request without credentials");
            unauthorized()
        }
    }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, REALM)]).into_response()
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    supervisor: Arc<StreamSupervisor>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Status endpoint listening on http://{}/health", addr);
    }
    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("Status endpoint shutting down");
        })
        .await
}
