//! HTTP surface of the gateway: health, the two socket upgrades, and
//! the `/internal` API used by executors and the executor manager.

pub mod callback;
pub mod internal;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::auth::token_eq;
use crate::state::AppState;
use crate::ws::{chat, device};

pub fn router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/callback", post(callback::handle_callback))
        .route("/callback/batch", post(callback::handle_batch_callback))
        .route("/heartbeat", post(internal::handle_heartbeat))
        .route("/tasks/status", post(internal::handle_task_status))
        .route("/tasks/pending", get(internal::handle_pending_tasks))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            internal_auth,
        ));

    Router::new()
        .route("/healthz", get(health))
        .route("/ws/chat", get(chat::chat_ws))
        .route("/ws/local-executor", get(device::device_ws))
        .nest("/internal", internal)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let redis_ok = state.store.ping().await.is_ok();
    let status = if redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if redis_ok { "ok" } else { "degraded" },
            "redis": redis_ok,
        })),
    )
}

/// Pre-shared bearer token check for `/internal/*`. An empty configured
/// token leaves the endpoints open (dev mode).
async fn internal_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let expected = &state.config.auth.internal_token;
    if !expected.is_empty() {
        let presented = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let ok = presented
            .map(|token| token_eq(token, expected))
            .unwrap_or(false);
        if !ok {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"error": "invalid internal token"})),
            )
                .into_response();
        }
    }
    next.run(request).await
}
