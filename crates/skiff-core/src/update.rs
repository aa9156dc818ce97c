//! Tick-driven status update pipeline.
//!
//! A single background task wakes every second, walks the registry under the
//! shared latch, and turns each participant's engine snapshot into a
//! [`StatusUpdate`]. Updates are offered to a bounded channel with a
//! non-blocking send: when the reducer is behind, the tick is dropped rather
//! than the producer stalled. Losing a tick is harmless because the next one
//! rebuilds from engine truth.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff_data::TorrentStatus;
use skiff_engine::{SwarmFileStat, SwarmStats};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::registry::{ManagedTorrent, Registry, TickState};

/// Updates the reducer can buffer before ticks are dropped.
pub const UPDATE_CHANNEL_CAPACITY: usize = 100;

/// Cadence of the updater loop.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// One observation of a participant, ready for the reducer.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Durable record id.
    pub torrent_id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// 40-hex infohash.
    pub info_hash: String,
    /// Derived lifecycle status.
    pub status: TorrentStatus,
    /// Completion percentage in `[0, 100]`.
    pub progress: f64,
    /// Total payload size; zero until metadata is known.
    pub total_size: u64,
    /// Bytes downloaded and verified.
    pub downloaded: u64,
    /// Bytes uploaded.
    pub uploaded: u64,
    /// Download speed derived from cumulative counters (bytes/s).
    pub download_speed: u64,
    /// Upload speed derived from cumulative counters (bytes/s).
    pub upload_speed: u64,
    /// Established peers.
    pub peers: u32,
    /// Complete peers.
    pub seeds: u32,
    /// Engine-reported name, once known.
    pub name: Option<String>,
    /// Per-file listing, rebuilt every tick.
    pub files: Vec<SwarmFileStat>,
    /// Engine or synthesised failure.
    pub error: Option<String>,
}

/// Derive the lifecycle status from an engine snapshot.
///
/// Order matters: unresolved metadata always reads as `pending`, a fully
/// downloaded payload as `completed`, an engine in seed mode as `seeding`,
/// then pause, then peer presence.
#[must_use]
pub fn derive_status(stats: &SwarmStats) -> TorrentStatus {
    if !stats.has_metadata {
        TorrentStatus::Pending
    } else if stats.total_bytes > 0 && stats.completed_bytes >= stats.total_bytes {
        TorrentStatus::Completed
    } else if stats.finished {
        TorrentStatus::Seeding
    } else if stats.is_paused {
        TorrentStatus::Paused
    } else if stats.peers > 0 {
        TorrentStatus::Downloading
    } else {
        TorrentStatus::Stalled
    }
}

fn speed(delta: u64, elapsed: f64) -> u64 {
    if elapsed <= f64::EPSILON {
        return 0;
    }
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    {
        ((delta as f64) / elapsed) as u64
    }
}

/// Build the update for one participant and the successor tick state.
///
/// Speeds come from the delta of the engine's cumulative counters against
/// the previous tick; the first tick reports zero.
#[must_use]
pub fn build_update(
    entry: &ManagedTorrent,
    stats: &SwarmStats,
    now: Instant,
) -> (StatusUpdate, TickState) {
    let previous = entry.tick_state();
    let (download_speed, upload_speed) = match previous.last_tick_at {
        Some(last) => {
            let elapsed = now.saturating_duration_since(last).as_secs_f64();
            (
                speed(
                    stats.cumulative_read.saturating_sub(previous.last_cumulative_read),
                    elapsed,
                ),
                speed(
                    stats
                        .cumulative_written
                        .saturating_sub(previous.last_cumulative_written),
                    elapsed,
                ),
            )
        }
        None => (0, 0),
    };

    let progress = if stats.total_bytes > 0 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = stats.completed_bytes.min(stats.total_bytes) as f64 / stats.total_bytes as f64;
        ratio * 100.0
    } else {
        0.0
    };

    let error = entry.failure().or_else(|| stats.error.clone());

    let update = StatusUpdate {
        torrent_id: entry.id,
        user_id: entry.user_id,
        info_hash: entry.info_hash.clone(),
        status: derive_status(stats),
        progress,
        total_size: stats.total_bytes,
        downloaded: stats.completed_bytes,
        uploaded: stats.cumulative_written,
        download_speed,
        upload_speed,
        peers: stats.peers,
        seeds: stats.seeds,
        name: entry.handle.name(),
        files: stats.files.clone(),
        error,
    };

    let next = TickState {
        last_tick_at: Some(now),
        last_cumulative_read: stats.cumulative_read,
        last_cumulative_written: stats.cumulative_written,
        last_download_speed: download_speed,
        last_upload_speed: upload_speed,
    };

    (update, next)
}

/// The 1 Hz producer task.
pub struct Updater {
    registry: Arc<Registry>,
    tx: mpsc::Sender<StatusUpdate>,
}

impl Updater {
    /// Create the updater and its bounded channel.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> (Self, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        (Self { registry, tx }, rx)
    }

    /// Produce one update per live participant and advance tick state.
    ///
    /// Enqueueing never blocks: a full channel drops the tick for that
    /// participant.
    pub fn tick_once(&self, now: Instant) {
        for entry in self.registry.iter() {
            let stats = entry.handle.stats();
            let (update, next) = build_update(&entry, &stats, now);
            match self.tx.try_send(update) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    debug!(torrent_id = %dropped.torrent_id, "update channel full, dropping tick");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("update channel closed");
                    return;
                }
            }
            entry.store_tick_state(next);
        }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.tick_once(Instant::now()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_engine::{StubSwarm, SwarmClient};

    const MAGNET: &str = "magnet:?xt=urn:btih:cccccccccccccccccccccccccccccccccccccccc";

    fn stats(total: u64, completed: u64, peers: u32) -> SwarmStats {
        SwarmStats {
            has_metadata: true,
            total_bytes: total,
            completed_bytes: completed,
            peers,
            cumulative_read: completed,
            ..SwarmStats::default()
        }
    }

    async fn entry() -> Arc<ManagedTorrent> {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        Arc::new(ManagedTorrent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            handle.info_hash(),
            handle,
        ))
    }

    #[test]
    fn status_derivation_follows_the_order() {
        let pending = SwarmStats::default();
        assert_eq!(derive_status(&pending), TorrentStatus::Pending);

        assert_eq!(derive_status(&stats(100, 100, 0)), TorrentStatus::Completed);

        let seeding = SwarmStats {
            finished: true,
            ..stats(100, 60, 0)
        };
        assert_eq!(derive_status(&seeding), TorrentStatus::Seeding);

        let paused = SwarmStats {
            is_paused: true,
            ..stats(100, 60, 0)
        };
        assert_eq!(derive_status(&paused), TorrentStatus::Paused);

        assert_eq!(derive_status(&stats(100, 60, 4)), TorrentStatus::Downloading);
        assert_eq!(derive_status(&stats(100, 60, 0)), TorrentStatus::Stalled);
    }

    #[tokio::test]
    async fn first_tick_reports_zero_speed() {
        let entry = entry().await;
        let (update, next) = build_update(&entry, &stats(1000, 100, 1), Instant::now());
        assert_eq!(update.download_speed, 0);
        assert_eq!(update.upload_speed, 0);
        assert_eq!(next.last_cumulative_read, 100);
        assert!(next.last_tick_at.is_some());
    }

    #[tokio::test]
    async fn speeds_come_from_counter_deltas() {
        let entry = entry().await;
        let start = Instant::now();
        let (_, first) = build_update(&entry, &stats(1000, 100, 1), start);
        entry.store_tick_state(first);

        let later = start + Duration::from_secs(2);
        let mut snapshot = stats(1000, 300, 1);
        snapshot.cumulative_written = 50;
        let (update, _) = build_update(&entry, &snapshot, later);
        // 200 bytes over 2 seconds.
        assert_eq!(update.download_speed, 100);
        assert_eq!(update.upload_speed, 25);
    }

    #[tokio::test]
    async fn progress_is_clamped_percentage() {
        let entry = entry().await;
        let (update, _) = build_update(&entry, &stats(200, 50, 0), Instant::now());
        assert!((update.progress - 25.0).abs() < f64::EPSILON);

        let (zero_total, _) = build_update(&entry, &SwarmStats::default(), Instant::now());
        assert!(zero_total.progress.abs() < f64::EPSILON);

        let (overshoot, _) = build_update(&entry, &stats(100, 150, 0), Instant::now());
        assert!((overshoot.progress - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn synthesised_failure_wins_over_engine_silence() {
        let entry = entry().await;
        entry.mark_failed("metadata fetch timed out");
        let (update, _) = build_update(&entry, &stats(100, 10, 0), Instant::now());
        assert_eq!(update.error.as_deref(), Some("metadata fetch timed out"));
    }

    #[tokio::test]
    async fn blocked_reducer_never_grows_the_channel() {
        let registry = Arc::new(Registry::new());
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
        registry.insert_if_absent(Arc::new(ManagedTorrent::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            handle.info_hash(),
            handle,
        )));

        let (updater, mut rx) = Updater::new(Arc::clone(&registry));
        // Nothing drains rx: capacity plus arbitrarily many extra ticks must
        // not block or grow the buffer.
        for _ in 0..UPDATE_CHANNEL_CAPACITY + 50 {
            updater.tick_once(Instant::now());
        }
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, UPDATE_CHANNEL_CAPACITY);
    }
}
