//! Operator surface: enumeration, platform stats, forced sweeps.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};

use crate::http::errors::ApiError;
use crate::http::torrents::{parse_page, PageQuery};
use crate::state::ApiState;

pub(crate) async fn list_users(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let (page, page_size) = parse_page(&query)?;
    let users = state
        .store
        .list_users(page_size, (page - 1) * page_size)
        .await?;
    let mut entries = Vec::with_capacity(users.len());
    for user in users {
        let subscription = state.store.subscription_for(user.id).await?;
        let plan = skiff_data::plans::resolve(user.role, subscription.as_ref());
        entries.push(json!({
            "id": user.id,
            "email": user.email,
            "role": user.role,
            "plan": plan.name,
            "created_at": user.created_at,
        }));
    }
    Ok(Json(json!({
        "users": entries,
        "page": page,
        "page_size": page_size,
        "total": state.store.count_users().await?,
    })))
}

pub(crate) async fn list_torrents(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let (page, page_size) = parse_page(&query)?;
    let records = state
        .store
        .list_all_torrents(page_size, (page - 1) * page_size)
        .await?;
    let torrents: Vec<_> = records
        .iter()
        .map(|record| {
            let entry = state.core.registry().lookup_by_id(record.id);
            skiff_core::detail_from(record, entry.as_deref())
        })
        .collect();
    Ok(Json(json!({
        "torrents": torrents,
        "page": page,
        "page_size": page_size,
    })))
}

pub(crate) async fn stats(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let (total, active, completed_bytes) = state.store.torrent_totals().await?;
    Ok(Json(json!({
        "users": state.store.count_users().await?,
        "torrents": total,
        "active_torrents": active,
        "live_participants": state.core.live_count(),
        "completed_bytes": completed_bytes,
    })))
}

pub(crate) async fn cleanup(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    let removed = state.core.sweep_now().await?;
    Ok(Json(json!({ "removed": removed })))
}
