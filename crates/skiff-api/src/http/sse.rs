//! Server-sent events: per-user status snapshots on a 1-second cadence.
//!
//! Each subscriber gets `connected` on attach, then every second a
//! `torrents` event with the caller's live projections (suppressed while
//! empty) and a `heartbeat`. A connection is capped at thirty minutes: a
//! `timeout` event is emitted and the stream ends, and the client is
//! expected to reconnect. Write failures end the stream silently: the peer
//! left.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Extension;
use serde_json::json;
use skiff_core::{Caller, TorrentProjection};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::error;

use crate::state::ApiState;

/// Snapshot cadence.
pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Wall cap per connection.
pub const CONNECTION_CAP: Duration = Duration::from_secs(30 * 60);

/// Event payload for `connected`.
#[must_use]
pub fn connected_payload() -> serde_json::Value {
    json!({ "status": "connected" })
}

/// Event payload for `heartbeat`.
#[must_use]
pub fn heartbeat_payload(unix_seconds: i64) -> serde_json::Value {
    json!({ "time": unix_seconds })
}

/// Event payload for `timeout`.
#[must_use]
pub fn timeout_payload() -> serde_json::Value {
    json!({ "message": "connection timeout, please reconnect" })
}

fn json_event(name: &'static str, payload: &serde_json::Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn snapshot_event(projections: &[TorrentProjection]) -> Option<Event> {
    if projections.is_empty() {
        return None;
    }
    match serde_json::to_string(projections) {
        Ok(body) => Some(Event::default().event("torrents").data(body)),
        Err(err) => {
            error!(error = %err, "failed to serialise torrent projections");
            None
        }
    }
}

fn projection_stream(
    state: Arc<ApiState>,
    scope: Option<Caller>,
) -> impl futures_core::Stream<Item = Result<Event, Infallible>> + Send {
    stream! {
        yield Ok(json_event("connected", &connected_payload()));

        let started = Instant::now();
        let mut ticker = interval(PUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if started.elapsed() >= CONNECTION_CAP {
                yield Ok(json_event("timeout", &timeout_payload()));
                break;
            }

            let projections = match scope {
                Some(caller) => state.core.projections_for_user(caller.user_id),
                None => state.core.projections_all(),
            };
            if let Some(event) = snapshot_event(&projections) {
                yield Ok(event);
            }
            yield Ok(json_event(
                "heartbeat",
                &heartbeat_payload(chrono::Utc::now().timestamp()),
            ));
        }
    }
}

pub(crate) async fn user_events(
    State(state): State<Arc<ApiState>>,
    Extension(caller): Extension<Caller>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>> + Send> {
    Sse::new(projection_stream(state, Some(caller))).keep_alive(KeepAlive::default())
}

pub(crate) async fn admin_events(
    State(state): State<Arc<ApiState>>,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>> + Send> {
    Sse::new(projection_stream(state, None)).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_data::TorrentStatus;
    use uuid::Uuid;

    #[test]
    fn payload_shapes_match_the_contract() {
        assert_eq!(connected_payload(), json!({ "status": "connected" }));
        assert_eq!(heartbeat_payload(1_750_000_000), json!({ "time": 1_750_000_000 }));
        assert_eq!(
            timeout_payload(),
            json!({ "message": "connection timeout, please reconnect" })
        );
    }

    #[test]
    fn empty_snapshots_are_suppressed() {
        assert!(snapshot_event(&[]).is_none());
    }

    #[test]
    fn non_empty_snapshots_produce_a_torrents_event() {
        let projections = vec![TorrentProjection {
            id: Uuid::nil(),
            info_hash: "a".repeat(40),
            status: TorrentStatus::Downloading,
            progress: 10.0,
            downloaded: 1,
            uploaded: 0,
            download_speed: 0,
            upload_speed: 0,
            peers: 1,
            seeds: 0,
            name: "pack".to_string(),
            total_size: 10,
            files: None,
            error: None,
        }];
        assert!(snapshot_event(&projections).is_some());
    }
}
