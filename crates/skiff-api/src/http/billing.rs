//! Billing collaborator seam.
//!
//! The payment provider integration lives outside this repository. Until a
//! provider is wired into the state, both endpoints answer 503 so clients
//! can distinguish "not configured" from "broken".

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::Value;

use crate::http::errors::ApiError;
use crate::state::ApiState;

pub(crate) async fn checkout(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    if !state.billing_configured {
        return Err(ApiError::unavailable("billing not configured"));
    }
    Err(ApiError::internal("billing provider dispatch is not wired"))
}

pub(crate) async fn webhook(State(state): State<Arc<ApiState>>) -> Result<Json<Value>, ApiError> {
    if !state.billing_configured {
        return Err(ApiError::unavailable("billing not configured"));
    }
    Err(ApiError::internal("billing provider dispatch is not wired"))
}
