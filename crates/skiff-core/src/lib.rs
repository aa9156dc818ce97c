#![forbid(unsafe_code)]

//! The torrent lifecycle core.
//!
//! Owns every live swarm participant and drives it from acceptance through
//! metadata fetch, piece download, completion, optional packaging, retention,
//! and removal. The moving parts:
//!
//! - [`registry::Registry`]: the infohash-keyed index of live participants,
//!   the only shared mutable structure in the core.
//! - [`update::Updater`]: the 1 Hz producer turning engine snapshots into
//!   [`update::StatusUpdate`] values on a bounded, drop-on-full channel.
//! - [`reducer::Reducer`]: the single consumer committing error, completion,
//!   and progress transitions to the durable store.
//! - [`reload::Reloader`]: one-shot startup rehydration from the store.
//! - [`package::Packager`]: off-path zip packaging for multi-file torrents.
//! - [`retention::Sweeper`]: the hourly expiry sweep.
//! - [`core::TorrentCore`]: the façade handed to the HTTP layer.

pub mod core;
pub mod error;
pub mod package;
pub mod projection;
pub mod reducer;
pub mod registry;
pub mod reload;
pub mod retention;
pub mod update;

pub use self::core::{
    arm_metadata_deadline, basename, generate_token, AddOutcome, Caller, CoreConfig, Download,
    TorrentCore, METADATA_DEADLINE,
};
pub use error::{CoreError, Result};
pub use projection::{detail_from, project_live, TorrentDetail, TorrentProjection};
pub use registry::{InsertOutcome, ManagedTorrent, Registry, TickState};
pub use update::{derive_status, StatusUpdate, TICK_INTERVAL, UPDATE_CHANNEL_CAPACITY};
