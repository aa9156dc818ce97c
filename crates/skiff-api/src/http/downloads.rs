//! Token-authenticated download streaming.
//!
//! `GET /download/{token}` is public: the token is the capability. Byte
//! ranges are honoured with `206 Partial Content`; the reader is seeked to
//! the range start and capped with `take`, then streamed with a
//! `ReaderStream` so a departing client tears the reader down with the
//! connection.

use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::http::errors::ApiError;
use crate::state::ApiState;

const STREAM_CHUNK_BYTES: usize = 64 * 1024;

/// A validated, inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes the range covers.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges are non-empty by construction.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a payload of `total` bytes.
    #[must_use]
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Parse a `Range` header against a payload length.
///
/// `Ok(None)` means no range was requested. Supported forms are
/// `bytes=a-b`, `bytes=a-`, and the suffix form `bytes=-n`; anything else,
/// or a range outside the payload, is a 416.
///
/// # Errors
///
/// Returns a 416 [`ApiError`] for malformed or unsatisfiable ranges.
pub fn parse_range(header: Option<&str>, length: u64) -> Result<Option<ByteRange>, ApiError> {
    let Some(raw) = header else {
        return Ok(None);
    };
    let unsatisfiable = || ApiError::range_not_satisfiable("invalid range");

    let spec = raw.strip_prefix("bytes=").ok_or_else(unsatisfiable)?;
    if spec.contains(',') {
        // Multipart ranges are not served.
        return Err(unsatisfiable());
    }
    let (start_raw, end_raw) = spec.split_once('-').ok_or_else(unsatisfiable)?;

    if start_raw.is_empty() {
        // Suffix form: the final n bytes.
        let suffix: u64 = end_raw.parse().map_err(|_| unsatisfiable())?;
        if suffix == 0 || length == 0 {
            return Err(unsatisfiable());
        }
        let start = length.saturating_sub(suffix);
        return Ok(Some(ByteRange {
            start,
            end: length - 1,
        }));
    }

    let start: u64 = start_raw.parse().map_err(|_| unsatisfiable())?;
    let end: u64 = if end_raw.is_empty() {
        length.checked_sub(1).ok_or_else(unsatisfiable)?
    } else {
        end_raw.parse().map_err(|_| unsatisfiable())?
    };
    if start > end || end >= length {
        return Err(unsatisfiable());
    }
    Ok(Some(ByteRange { start, end }))
}

fn content_disposition(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|ch| if ch == '"' || ch.is_control() { '_' } else { ch })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

pub(crate) async fn download(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let download = state.core.open_download(&token).await?;
    let length = download.reader.length;
    let mut reader = download.reader.reader;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let range = parse_range(range_header, length)?;
    debug!(filename = %download.filename, ?range, length, "serving download");

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&download.filename),
    );

    let (status, body_len) = match range {
        Some(range) => {
            reader
                .seek(SeekFrom::Start(range.start))
                .await
                .map_err(|err| ApiError::internal(format!("seek failed: {err}")))?;
            response_headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&range.content_range(length))
                    .map_err(|err| ApiError::internal(format!("bad content range: {err}")))?,
            );
            (StatusCode::PARTIAL_CONTENT, range.len())
        }
        None => (StatusCode::OK, length),
    };
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body_len.to_string())
            .map_err(|err| ApiError::internal(format!("bad content length: {err}")))?,
    );

    let stream = ReaderStream::with_capacity(reader.take(body_len), STREAM_CHUNK_BYTES);
    Ok((status, (response_headers, Body::from_stream(stream))).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_header_means_full_body() {
        assert_eq!(parse_range(None, 1000).expect("parses"), None);
    }

    #[test]
    fn bounded_range_parses_inclusively() {
        let range = parse_range(Some("bytes=100-199"), 1000)
            .expect("parses")
            .expect("range present");
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 199);
        assert_eq!(range.len(), 100);
        assert_eq!(range.content_range(1000), "bytes 100-199/1000");
    }

    #[test]
    fn open_ended_range_runs_to_the_last_byte() {
        let range = parse_range(Some("bytes=900-"), 1000)
            .expect("parses")
            .expect("range present");
        assert_eq!(range.start, 900);
        assert_eq!(range.end, 999);
    }

    #[test]
    fn suffix_range_takes_the_tail() {
        let range = parse_range(Some("bytes=-100"), 1000)
            .expect("parses")
            .expect("range present");
        assert_eq!(range.start, 900);
        assert_eq!(range.end, 999);

        let oversized = parse_range(Some("bytes=-5000"), 1000)
            .expect("parses")
            .expect("range present");
        assert_eq!(oversized.start, 0);
    }

    #[test]
    fn out_of_bounds_and_garbage_are_416() {
        for header in [
            "bytes=1000-1000",
            "bytes=100-99",
            "bytes=abc-def",
            "bytes=0-0,5-9",
            "items=0-1",
            "bytes=-0",
        ] {
            let err = parse_range(Some(header), 1000).expect_err(header);
            assert_eq!(err.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{header}");
        }
    }

    #[test]
    fn single_byte_range_is_satisfiable() {
        let range = parse_range(Some("bytes=0-0"), 1)
            .expect("parses")
            .expect("range present");
        assert_eq!(range.len(), 1);
        assert_eq!(range.content_range(1), "bytes 0-0/1");
    }

    #[test]
    fn disposition_quotes_are_neutralised() {
        let value = content_disposition("weird\"name.bin");
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"weird_name.bin\""
        );
    }
}
