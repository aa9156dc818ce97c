//! In-memory index of live swarm participants.
//!
//! The registry is the only shared mutable structure in the core. It is keyed
//! by infohash: at most one [`ManagedTorrent`] exists per infohash process-
//! wide, and `insert_if_absent` is the tie-break for duplicate adds. Readers
//! take the shared latch; the three writers (admission, removal, sweep) take
//! the exclusive latch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use skiff_engine::SharedHandle;
use uuid::Uuid;

/// Tick-local counters owned by the updater.
///
/// Mutated only from the updater task; everyone else reads a copy.
#[derive(Debug, Clone, Default)]
pub struct TickState {
    /// Wall-clock instant of the previous tick, `None` before the first.
    pub last_tick_at: Option<Instant>,
    /// Cumulative payload bytes read at the previous tick.
    pub last_cumulative_read: u64,
    /// Cumulative payload bytes written at the previous tick.
    pub last_cumulative_written: u64,
    /// Download speed derived at the previous tick (bytes/s).
    pub last_download_speed: u64,
    /// Upload speed derived at the previous tick (bytes/s).
    pub last_upload_speed: u64,
}

/// In-memory envelope pairing an engine handle with its durable record.
pub struct ManagedTorrent {
    /// Durable record id.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// 40-hex infohash (registry key).
    pub info_hash: String,
    /// Engine handle owned by the swarm adapter.
    pub handle: SharedHandle,
    /// When the participant was admitted.
    pub added_at: DateTime<Utc>,
    tick: Mutex<TickState>,
    failure: Mutex<Option<String>>,
}

impl ManagedTorrent {
    /// Wrap a freshly admitted engine handle.
    #[must_use]
    pub fn new(id: Uuid, user_id: Uuid, info_hash: String, handle: SharedHandle) -> Self {
        Self {
            id,
            user_id,
            info_hash,
            handle,
            added_at: Utc::now(),
            tick: Mutex::new(TickState::default()),
            failure: Mutex::new(None),
        }
    }

    /// Copy of the tick-local counters.
    #[must_use]
    pub fn tick_state(&self) -> TickState {
        self.tick
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the tick-local counters (updater only).
    pub fn store_tick_state(&self, next: TickState) {
        *self.tick.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Record a synthesised failure (e.g. metadata deadline exceeded). Every
    /// subsequent tick reports it through the update pipeline until the user
    /// removes the torrent.
    pub fn mark_failed(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Synthesised failure, if one was recorded.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Outcome of [`Registry::insert_if_absent`].
pub enum InsertOutcome {
    /// The entry was inserted.
    Inserted,
    /// The infohash was already present; the existing entry is returned and
    /// the map is unchanged.
    Existing(Arc<ManagedTorrent>),
}

/// Infohash-keyed index of live participants.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<HashMap<String, Arc<ManagedTorrent>>>,
}

impl Registry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless the infohash is already present.
    pub fn insert_if_absent(&self, entry: Arc<ManagedTorrent>) -> InsertOutcome {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = map.get(&entry.info_hash) {
            return InsertOutcome::Existing(Arc::clone(existing));
        }
        map.insert(entry.info_hash.clone(), entry);
        InsertOutcome::Inserted
    }

    /// Fetch by infohash.
    #[must_use]
    pub fn lookup(&self, info_hash: &str) -> Option<Arc<ManagedTorrent>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(info_hash)
            .cloned()
    }

    /// Fetch by record id (linear scan; the registry is small).
    #[must_use]
    pub fn lookup_by_id(&self, id: Uuid) -> Option<Arc<ManagedTorrent>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|entry| entry.id == id)
            .map(Arc::clone)
    }

    /// Remove and return the entry for an infohash.
    pub fn remove(&self, info_hash: &str) -> Option<Arc<ManagedTorrent>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(info_hash)
    }

    /// Snapshot of every live participant.
    #[must_use]
    pub fn iter(&self) -> Vec<Arc<ManagedTorrent>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one user's live participants.
    #[must_use]
    pub fn iter_by_user(&self, user_id: Uuid) -> Vec<Arc<ManagedTorrent>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Number of live participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_engine::StubSwarm;
    use skiff_engine::SwarmClient;

    const MAGNET_A: &str = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const MAGNET_B: &str = "magnet:?xt=urn:btih:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    async fn managed(user_id: Uuid, magnet: &str) -> Arc<ManagedTorrent> {
        let swarm = StubSwarm::new(".");
        let handle = swarm.add_magnet(magnet).await.expect("magnet accepted");
        Arc::new(ManagedTorrent::new(
            Uuid::new_v4(),
            user_id,
            handle.info_hash(),
            handle,
        ))
    }

    #[tokio::test]
    async fn insert_if_absent_is_first_arrival_wins() {
        let registry = Registry::new();
        let user = Uuid::new_v4();
        let first = managed(user, MAGNET_A).await;
        let second = managed(Uuid::new_v4(), MAGNET_A).await;

        assert!(matches!(
            registry.insert_if_absent(Arc::clone(&first)),
            InsertOutcome::Inserted
        ));
        match registry.insert_if_absent(second) {
            InsertOutcome::Existing(existing) => assert_eq!(existing.id, first.id),
            InsertOutcome::Inserted => panic!("duplicate infohash must not insert"),
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn per_user_iteration_filters() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        registry.insert_if_absent(managed(alice, MAGNET_A).await);
        registry.insert_if_absent(managed(bob, MAGNET_B).await);

        assert_eq!(registry.iter().len(), 2);
        assert_eq!(registry.iter_by_user(alice).len(), 1);
        assert_eq!(registry.iter_by_user(bob).len(), 1);
        assert_eq!(registry.iter_by_user(Uuid::new_v4()).len(), 0);
    }

    #[tokio::test]
    async fn remove_frees_the_infohash() {
        let registry = Registry::new();
        let entry = managed(Uuid::new_v4(), MAGNET_A).await;
        let info_hash = entry.info_hash.clone();
        registry.insert_if_absent(entry);

        assert!(registry.lookup(&info_hash).is_some());
        assert!(registry.remove(&info_hash).is_some());
        assert!(registry.lookup(&info_hash).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn lookup_by_id_matches_records() {
        let registry = Registry::new();
        let entry = managed(Uuid::new_v4(), MAGNET_A).await;
        let id = entry.id;
        registry.insert_if_absent(entry);
        assert!(registry.lookup_by_id(id).is_some());
        assert!(registry.lookup_by_id(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn synthesised_failures_stick() {
        let entry = managed(Uuid::new_v4(), MAGNET_A).await;
        assert!(entry.failure().is_none());
        entry.mark_failed("metadata fetch timed out");
        assert_eq!(
            entry.failure().as_deref(),
            Some("metadata fetch timed out")
        );
    }
}
