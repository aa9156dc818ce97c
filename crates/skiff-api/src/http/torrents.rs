//! Torrent lifecycle handlers.

use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use skiff_core::Caller;
use uuid::Uuid;

use crate::http::errors::ApiError;
use crate::state::ApiState;

/// Upper bound for uploaded metainfo and fetched torrent URLs.
pub const MAX_METAINFO_BYTES: usize = 50 * 1024 * 1024;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub(crate) struct AddTorrentRequest {
    #[serde(default)]
    magnet_uri: Option<String>,
    #[serde(default)]
    torrent_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct PageQuery {
    #[serde(default)]
    page: Option<String>,
    #[serde(default)]
    page_size: Option<String>,
}

/// Parse pagination parameters, rejecting garbage with a 400.
pub(crate) fn parse_page(query: &PageQuery) -> Result<(i64, i64), ApiError> {
    let page = match query.page.as_deref() {
        None | Some("") => 1,
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|page| *page >= 1)
            .ok_or_else(|| ApiError::bad_request("invalid page parameter"))?,
    };
    let page_size = match query.page_size.as_deref() {
        None | Some("") => DEFAULT_PAGE_SIZE,
        Some(raw) => raw
            .parse::<i64>()
            .ok()
            .filter(|size| (1..=MAX_PAGE_SIZE).contains(size))
            .ok_or_else(|| ApiError::bad_request("invalid page_size parameter"))?,
    };
    Ok((page, page_size))
}

pub(crate) fn parse_record_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request("invalid torrent id"))
}

pub(crate) async fn add(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<AddTorrentRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = match (body.magnet_uri.as_deref(), body.torrent_url.as_deref()) {
        (Some(magnet), _) if !magnet.trim().is_empty() => {
            state.core.add_magnet(&caller, magnet.trim()).await?
        }
        (_, Some(url)) if !url.trim().is_empty() => {
            let bytes = fetch_metainfo(&state, url.trim()).await?;
            state.core.add_metainfo(&caller, &bytes).await?
        }
        _ => {
            return Err(ApiError::bad_request(
                "either magnet_uri or torrent_url is required",
            ));
        }
    };

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let entry = state.core.registry().lookup_by_id(outcome.record.id);
    let detail = skiff_core::detail_from(&outcome.record, entry.as_deref());
    Ok((status, Json(json!({ "torrent": detail }))))
}

async fn fetch_metainfo(state: &ApiState, url: &str) -> Result<Vec<u8>, ApiError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ApiError::bad_request("torrent_url must be http or https"));
    }
    let response = state
        .http
        .get(url)
        .send()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to fetch torrent_url: {err}")))?;
    if !response.status().is_success() {
        return Err(ApiError::bad_request(format!(
            "torrent_url returned status {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read torrent_url: {err}")))?;
    if bytes.len() > MAX_METAINFO_BYTES {
        return Err(ApiError::payload_too_large("torrent file is too large"));
    }
    Ok(bytes.to_vec())
}

pub(crate) async fn upload(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart payload: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        if !filename.to_ascii_lowercase().ends_with(".torrent") {
            return Err(ApiError::bad_request("file must have a .torrent extension"));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?;
        if bytes.len() > MAX_METAINFO_BYTES {
            return Err(ApiError::payload_too_large("torrent file is too large"));
        }
        if bytes.is_empty() {
            return Err(ApiError::bad_request("torrent file is empty"));
        }
        let outcome = state.core.add_metainfo(&caller, &bytes).await?;
        let status = if outcome.created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        let entry = state.core.registry().lookup_by_id(outcome.record.id);
        let detail = skiff_core::detail_from(&outcome.record, entry.as_deref());
        return Ok((status, Json(json!({ "torrent": detail }))));
    }
    Err(ApiError::bad_request("multipart field 'file' is required"))
}

pub(crate) async fn list(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, ApiError> {
    let (page, page_size) = parse_page(&query)?;
    let (torrents, total) = state.core.list(&caller, page, page_size).await?;
    Ok(Json(json!({
        "torrents": torrents,
        "page": page,
        "page_size": page_size,
        "total": total,
    })))
}

pub(crate) async fn detail(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_record_id(&id)?;
    let detail = state.core.get(&caller, id).await?;
    Ok(Json(json!({ "torrent": detail })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DeleteQuery {
    #[serde(default)]
    delete_files: Option<bool>,
}

pub(crate) async fn remove(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_record_id(&id)?;
    state
        .core
        .remove(&caller, id, query.delete_files.unwrap_or(false))
        .await?;
    Ok(Json(json!({ "status": "removed" })))
}

pub(crate) async fn pause(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_record_id(&id)?;
    state.core.pause(&caller, id).await?;
    Ok(Json(json!({ "status": "paused" })))
}

pub(crate) async fn resume(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_record_id(&id)?;
    state.core.resume(&caller, id).await?;
    Ok(Json(json!({ "status": "resumed" })))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct MintTokenRequest {
    #[serde(default)]
    file_path: Option<String>,
    #[serde(default)]
    use_zip: Option<bool>,
}

pub(crate) async fn mint_token(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<MintTokenRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let id = parse_record_id(&id)?;
    let token = state
        .core
        .mint_token(&caller, id, body.file_path, body.use_zip.unwrap_or(false))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": token.token,
            "download_url": format!("/download/{}", token.token),
            "expires_at": token.expires_at,
            "max_downloads": token.max_downloads,
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: Option<&str>, size: Option<&str>) -> PageQuery {
        PageQuery {
            page: page.map(str::to_string),
            page_size: size.map(str::to_string),
        }
    }

    #[test]
    fn pagination_defaults_apply() {
        let (page, size) = parse_page(&query(None, None)).expect("defaults parse");
        assert_eq!(page, 1);
        assert_eq!(size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn pagination_rejects_garbage() {
        assert!(parse_page(&query(Some("zero"), None)).is_err());
        assert!(parse_page(&query(Some("0"), None)).is_err());
        assert!(parse_page(&query(None, Some("-4"))).is_err());
        assert!(parse_page(&query(None, Some("1000"))).is_err());
    }

    #[test]
    fn pagination_accepts_explicit_values() {
        let (page, size) = parse_page(&query(Some("3"), Some("50"))).expect("parses");
        assert_eq!(page, 3);
        assert_eq!(size, 50);
    }

    #[test]
    fn record_ids_must_be_uuids() {
        assert!(parse_record_id("not-a-uuid").is_err());
        assert!(parse_record_id(&Uuid::new_v4().to_string()).is_ok());
    }
}
