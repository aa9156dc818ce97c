//! API error type with stable wire codes.
//!
//! Every handler returns `Result<_, ApiError>`. The body is always
//! `{"error": …}` with an optional `"code"` that clients key behaviour off
//! (`TOKEN_EXPIRED` triggers refresh, `CONCURRENT_LIMIT`/`BANDWIDTH_LIMIT`
//! explain quota 403s, `TORRENT_EXISTS` marks duplicate adds,
//! `RATE_LIMITED` carries `Retry-After`). Internal faults are logged and
//! surfaced as an opaque 500.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use skiff_core::CoreError;
use tracing::error;

/// Structured API error.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: Option<&'static str>,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    const fn new(status: StatusCode, message: String) -> Self {
        Self {
            status,
            code: None,
            message,
            retry_after: None,
        }
    }

    /// Attach a stable wire code.
    #[must_use]
    pub const fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    /// 400 with a caller-facing description.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into())
    }

    /// 401.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message.into())
    }

    /// 403.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message.into())
    }

    /// 404.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message.into())
    }

    /// 409.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message.into())
    }

    /// 410.
    pub fn gone(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, message.into())
    }

    /// 413.
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message.into())
    }

    /// 416.
    pub fn range_not_satisfiable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RANGE_NOT_SATISFIABLE, message.into())
    }

    /// 429 with `Retry-After`.
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limit exceeded".to_string(),
        )
        .with_code("RATE_LIMITED");
        err.retry_after = Some(retry_after_secs);
        err
    }

    /// Opaque 500.
    pub fn internal(message: impl Into<String>) -> Self {
        let detail: String = message.into();
        error!(detail, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
    }

    /// 503.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message.into())
    }

    /// The HTTP status this error renders with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.code {
            Some(code) => json!({ "error": self.message, "code": code }),
            None => json!({ "error": self.message }),
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConcurrentLimit { .. } => {
                Self::forbidden(err.to_string()).with_code("CONCURRENT_LIMIT")
            }
            CoreError::BandwidthLimit { .. } => {
                Self::forbidden(err.to_string()).with_code("BANDWIDTH_LIMIT")
            }
            CoreError::Capacity => Self::unavailable(err.to_string()),
            CoreError::Duplicate { .. } => {
                Self::conflict(err.to_string()).with_code("TORRENT_EXISTS")
            }
            CoreError::NotFound => Self::not_found(err.to_string()),
            CoreError::Forbidden => Self::forbidden(err.to_string()),
            CoreError::NotCompleted
            | CoreError::UnknownFile { .. }
            | CoreError::ArchiveUnavailable
            | CoreError::InvalidInput { .. } => Self::bad_request(err.to_string()),
            CoreError::TokenNotFound => Self::not_found(err.to_string()),
            CoreError::TokenGone => Self::gone(err.to_string()),
            CoreError::Engine(inner) => Self::internal(inner.to_string()),
            CoreError::Store(inner) => Self::internal(inner.to_string()),
            CoreError::Io(inner) => Self::internal(inner.to_string()),
        }
    }
}

impl From<skiff_data::DataError> for ApiError {
    fn from(err: skiff_data::DataError) -> Self {
        Self::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_errors_map_to_403_with_codes() {
        let err: ApiError = CoreError::ConcurrentLimit { limit: 1 }.into();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code, Some("CONCURRENT_LIMIT"));

        let err: ApiError = CoreError::BandwidthLimit { limit: 1 }.into();
        assert_eq!(err.code, Some("BANDWIDTH_LIMIT"));
    }

    #[test]
    fn duplicate_maps_to_409_torrent_exists() {
        let err: ApiError = CoreError::Duplicate {
            existing_id: uuid::Uuid::nil(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.code, Some("TORRENT_EXISTS"));
    }

    #[test]
    fn token_errors_split_404_and_410_with_one_message() {
        let missing: ApiError = CoreError::TokenNotFound.into();
        let gone: ApiError = CoreError::TokenGone.into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(gone.status(), StatusCode::GONE);
        assert_eq!(missing.message, gone.message);
    }

    #[test]
    fn internal_faults_are_opaque() {
        let err: ApiError = CoreError::Store(skiff_data::DataError::Corrupt {
            field: "torrents.status",
            value: "limbo".to_string(),
        })
        .into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }
}
