//! Shared state injected into every handler.

use std::sync::Arc;

use skiff_config::JwtConfig;
use skiff_core::TorrentCore;
use skiff_data::Store;

use crate::http::auth::AuthKeys;
use crate::http::rate_limit::RateLimiter;

/// Process-wide dependencies for the HTTP surface.
pub struct ApiState {
    /// The lifecycle core.
    pub core: Arc<TorrentCore>,
    /// The durable store (auth and admin read it directly).
    pub store: Store,
    /// JWT key material.
    pub keys: AuthKeys,
    /// Request limiter.
    pub limiter: Arc<RateLimiter>,
    /// Outbound client for `torrent_url` fetches.
    pub http: reqwest::Client,
    /// Whether a billing provider is wired up.
    pub billing_configured: bool,
}

impl ApiState {
    /// Assemble the handler state.
    #[must_use]
    pub fn new(core: Arc<TorrentCore>, jwt: &JwtConfig) -> Arc<Self> {
        let store = core.store().clone();
        Arc::new(Self {
            core,
            store,
            keys: AuthKeys::new(&jwt.secret, jwt.access_expiry, jwt.refresh_expiry),
            limiter: Arc::new(RateLimiter::new()),
            http: reqwest::Client::new(),
            billing_configured: false,
        })
    }
}
