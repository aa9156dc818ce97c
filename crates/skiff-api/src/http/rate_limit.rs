//! Fixed-window request limiter.
//!
//! One window per identity: the authenticated user id when present,
//! otherwise the remote address. Windows are counters pinned to their start
//! instant; a background task drops stale windows every two window lengths.
//! Over-limit responses carry `Retry-After` with the seconds left in the
//! window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use skiff_core::Caller;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::http::errors::ApiError;
use crate::state::ApiState;

/// Window length.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per identity per window.
pub const LIMIT: u32 = 100;

struct Window {
    started: Instant,
    count: u32,
}

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request may proceed.
    Allow,
    /// Request is over the limit; retry after this many seconds.
    Deny {
        /// Whole seconds until the window rolls.
        retry_after_secs: u64,
    },
}

/// Fixed-window counter store.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    /// Limiter with the production limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(LIMIT, WINDOW)
    }

    /// Limiter with explicit limits (tests).
    #[must_use]
    pub fn with_limits(limit: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    /// Record a request for `identity` and decide its fate.
    pub fn check(&self, identity: &str, now: Instant) -> Decision {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = windows.entry(identity.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(slot.started) >= self.window {
            slot.started = now;
            slot.count = 0;
        }
        if slot.count >= self.limit {
            let elapsed = now.duration_since(slot.started);
            let remaining = self.window.saturating_sub(elapsed);
            return Decision::Deny {
                retry_after_secs: remaining.as_secs().max(1),
            };
        }
        slot.count += 1;
        Decision::Allow
    }

    /// Drop windows idle for at least two window lengths.
    pub fn cleanup(&self, now: Instant) {
        let horizon = self.window * 2;
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|_, slot| now.duration_since(slot.started) < horizon);
    }

    /// Number of tracked identities (tests).
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawn the periodic cleanup task.
    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.window * 2);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => limiter.cleanup(Instant::now()),
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware enforcing the limiter. Runs after authentication so logged-in
/// traffic buckets by user id; anonymous traffic buckets by peer address.
pub(crate) async fn rate_limit(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request
        .extensions()
        .get::<Caller>()
        .map(|caller| format!("user:{}", caller.user_id))
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|info| format!("ip:{}", info.0.ip()))
        })
        .unwrap_or_else(|| "anonymous".to_string());

    match state.limiter.check(&identity, Instant::now()) {
        Decision::Allow => Ok(next.run(request).await),
        Decision::Deny { retry_after_secs } => {
            debug!(identity, retry_after_secs, "request rate limited");
            Err(ApiError::rate_limited(retry_after_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_within_the_limit_pass() {
        let limiter = RateLimiter::with_limits(3, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.check("a", now), Decision::Allow);
        }
        assert!(matches!(limiter.check("a", now), Decision::Deny { .. }));
    }

    #[test]
    fn identities_are_isolated() {
        let limiter = RateLimiter::with_limits(1, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(limiter.check("a", now), Decision::Allow);
        assert_eq!(limiter.check("b", now), Decision::Allow);
        assert!(matches!(limiter.check("a", now), Decision::Deny { .. }));
    }

    #[test]
    fn the_window_rolls_over() {
        let limiter = RateLimiter::with_limits(1, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.check("a", start), Decision::Allow);
        assert!(matches!(limiter.check("a", start), Decision::Deny { .. }));
        let later = start + Duration::from_secs(61);
        assert_eq!(limiter.check("a", later), Decision::Allow);
    }

    #[test]
    fn retry_after_reflects_window_remainder() {
        let limiter = RateLimiter::with_limits(1, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.check("a", start), Decision::Allow);
        let twenty_in = start + Duration::from_secs(20);
        match limiter.check("a", twenty_in) {
            Decision::Deny { retry_after_secs } => {
                assert!(retry_after_secs <= 40, "got {retry_after_secs}");
                assert!(retry_after_secs >= 39, "got {retry_after_secs}");
            }
            Decision::Allow => panic!("expected denial"),
        }
    }

    #[test]
    fn cleanup_drops_stale_windows_after_two_lengths() {
        let limiter = RateLimiter::with_limits(1, Duration::from_secs(60));
        let start = Instant::now();
        limiter.check("a", start);
        limiter.check("b", start + Duration::from_secs(90));
        assert_eq!(limiter.tracked(), 2);

        limiter.cleanup(start + Duration::from_secs(125));
        assert_eq!(limiter.tracked(), 1);

        limiter.cleanup(start + Duration::from_secs(300));
        assert_eq!(limiter.tracked(), 0);
    }
}
