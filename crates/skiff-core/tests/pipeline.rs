//! End-to-end exercise of the update pipeline over the scripted swarm:
//! registry admission, status derivation across the lifecycle, speed
//! computation from counter deltas, and the drop-on-full channel contract.

use std::sync::Arc;
use std::time::{Duration, Instant};

use skiff_core::registry::{InsertOutcome, ManagedTorrent, Registry};
use skiff_core::update::{Updater, UPDATE_CHANNEL_CAPACITY};
use skiff_data::TorrentStatus;
use skiff_engine::{StubSwarm, SwarmClient, SwarmFileStat, SwarmHandle, SwarmStats};
use uuid::Uuid;

const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567";

async fn admitted(swarm: &StubSwarm) -> (Arc<ManagedTorrent>, Arc<skiff_engine::stub::StubHandle>) {
    let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
    let scripted = swarm.handle(&handle.info_hash()).expect("stub handle");
    let entry = Arc::new(ManagedTorrent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        handle.info_hash(),
        handle,
    ));
    (entry, scripted)
}

#[tokio::test]
async fn lifecycle_states_flow_through_the_pipeline() {
    let swarm = StubSwarm::new(".");
    let (entry, scripted) = admitted(&swarm).await;

    let registry = Arc::new(Registry::new());
    assert!(matches!(
        registry.insert_if_absent(Arc::clone(&entry)),
        InsertOutcome::Inserted
    ));

    let (updater, mut rx) = Updater::new(Arc::clone(&registry));
    let start = Instant::now();

    // Tick 1: magnet still resolving.
    updater.tick_once(start);
    let update = rx.try_recv().expect("update produced");
    assert_eq!(update.status, TorrentStatus::Pending);
    assert_eq!(update.download_speed, 0);

    // Metadata arrives; a peer connects; bytes flow.
    scripted.set_metadata(
        Some("hello".to_string()),
        vec![SwarmFileStat {
            path: "hello.bin".to_string(),
            size: 1_048_576,
            completed: 0,
        }],
    );
    scripted.set_stats(SwarmStats {
        has_metadata: true,
        total_bytes: 1_048_576,
        completed_bytes: 262_144,
        peers: 5,
        seeds: 1,
        cumulative_read: 262_144,
        files: vec![SwarmFileStat {
            path: "hello.bin".to_string(),
            size: 1_048_576,
            completed: 262_144,
        }],
        ..SwarmStats::default()
    });
    updater.tick_once(start + Duration::from_secs(1));
    let update = rx.try_recv().expect("update produced");
    assert_eq!(update.status, TorrentStatus::Downloading);
    assert_eq!(update.download_speed, 262_144);
    assert!((update.progress - 25.0).abs() < f64::EPSILON);
    assert_eq!(update.files.len(), 1);

    // Paused by the user: no peers allowed, status follows.
    scripted.pause().await.expect("pause accepted");
    updater.tick_once(start + Duration::from_secs(2));
    let update = rx.try_recv().expect("update produced");
    assert_eq!(update.status, TorrentStatus::Paused);
    assert_eq!(update.peers, 0);

    // Resume and finish.
    scripted.resume().await.expect("resume accepted");
    scripted.finish();
    updater.tick_once(start + Duration::from_secs(3));
    let update = rx.try_recv().expect("update produced");
    assert_eq!(update.status, TorrentStatus::Completed);
    assert!((update.progress - 100.0).abs() < f64::EPSILON);
    assert_eq!(update.downloaded, 1_048_576);
}

#[tokio::test]
async fn duplicate_admission_returns_the_first_owner() {
    let swarm = StubSwarm::new(".");
    let (first, _) = admitted(&swarm).await;
    let registry = Registry::new();
    registry.insert_if_absent(Arc::clone(&first));

    let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
    let second = Arc::new(ManagedTorrent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        handle.info_hash(),
        handle,
    ));
    match registry.insert_if_absent(second) {
        InsertOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
        InsertOutcome::Inserted => panic!("duplicate infohash must hit the tie-break"),
    }

    // After removal the infohash is free again and a new admission wins.
    registry.remove(&first.info_hash);
    let handle = swarm.add_magnet(MAGNET).await.expect("magnet accepted");
    let third = Arc::new(ManagedTorrent::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        handle.info_hash(),
        handle,
    ));
    assert!(matches!(
        registry.insert_if_absent(third),
        InsertOutcome::Inserted
    ));
}

#[tokio::test]
async fn synthesised_failures_reach_the_channel_every_tick() {
    let swarm = StubSwarm::new(".");
    let (entry, _) = admitted(&swarm).await;
    let registry = Arc::new(Registry::new());
    registry.insert_if_absent(Arc::clone(&entry));
    entry.mark_failed("metadata fetch timed out");

    let (updater, mut rx) = Updater::new(Arc::clone(&registry));
    for tick in 0..3 {
        updater.tick_once(Instant::now());
        let update = rx.try_recv().expect("update produced");
        assert_eq!(
            update.error.as_deref(),
            Some("metadata fetch timed out"),
            "tick {tick}"
        );
    }
}

#[tokio::test]
async fn a_wedged_consumer_only_costs_dropped_ticks() {
    let swarm = StubSwarm::new(".");
    let (entry, _) = admitted(&swarm).await;
    let registry = Arc::new(Registry::new());
    registry.insert_if_absent(entry);

    let (updater, mut rx) = Updater::new(Arc::clone(&registry));
    for _ in 0..UPDATE_CHANNEL_CAPACITY * 3 {
        updater.tick_once(Instant::now());
    }
    let mut buffered = 0;
    while rx.try_recv().is_ok() {
        buffered += 1;
    }
    assert_eq!(buffered, UPDATE_CHANNEL_CAPACITY);

    // Once drained, fresh ticks flow again.
    updater.tick_once(Instant::now());
    assert!(rx.try_recv().is_ok());
}
