#![forbid(unsafe_code)]

//! HTTP surface for Skiff.
//!
//! The crate exposes [`state::ApiState`] (everything handlers need) and
//! [`http::router::build_router`], which assembles the full route table:
//! auth, torrent lifecycle, token-authenticated downloads with byte ranges,
//! SSE status streams, the admin surface, the billing seam, and the
//! process-wide rate limiter.

pub mod http;
pub mod state;

pub use http::errors::ApiError;
pub use http::router::build_router;
pub use state::ApiState;
