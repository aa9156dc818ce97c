//! Route table assembly.
//!
//! Three groups with different guards: public (rate limited by peer
//! address), authenticated (bearer middleware, then rate limited by user),
//! and admin (bearer middleware, role check, then rate limited by user).
//! Layer order note: the layer added last runs first, so rate limiting is
//! attached before authentication within each group.

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::http::{admin, auth, billing, downloads, rate_limit, sse, torrents};
use crate::state::ApiState;

/// Request bodies above this size are refused with 413.
const MAX_BODY_BYTES: usize = torrents::MAX_METAINFO_BYTES + 1024 * 1024;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the complete route table over the shared state.
#[must_use]
pub fn build_router(state: Arc<ApiState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/billing/checkout", post(billing::checkout))
        .route("/billing/webhook", post(billing::webhook))
        .route("/download/{token}", get(downloads::download))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit,
        ));

    let authed = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/torrents", post(torrents::add).get(torrents::list))
        .route("/torrents/upload", post(torrents::upload))
        .route(
            "/torrents/{id}",
            get(torrents::detail).delete(torrents::remove),
        )
        .route("/torrents/{id}/pause", post(torrents::pause))
        .route("/torrents/{id}/resume", post(torrents::resume))
        .route("/torrents/{id}/token", post(torrents::mint_token))
        .route("/events", get(sse::user_events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    let admin = Router::new()
        .route("/admin/users", get(admin::list_users))
        .route("/admin/torrents", get(admin::list_torrents))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/cleanup", post(admin::cleanup))
        .route("/admin/events", get(sse::admin_events))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit,
        ))
        .route_layer(middleware::from_fn(auth::require_admin))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(authed)
        .merge(admin)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
