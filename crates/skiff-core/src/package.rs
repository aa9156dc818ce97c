//! Archive packaging and staging-tree path discipline.
//!
//! Multi-file torrents are packaged into a single deflate zip at the staging
//! root once they complete. All filesystem joins in the core flow through
//! [`guarded_join`], which canonicalises both sides and rejects anything that
//! escapes the staging directory, so an engine that ever produced an absolute
//! or `..`-laden path would be refused rather than followed.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use skiff_data::Store;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{CoreError, Result};

/// Characters replaced when deriving an archive filename.
const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Longest sanitised name kept before the `.zip` suffix.
const MAX_NAME_LEN: usize = 200;

/// Fallback archive stem for degenerate names.
const FALLBACK_NAME: &str = "download";

/// Derive a safe archive stem from a torrent name.
#[must_use]
pub fn sanitize_archive_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|ch| {
            if INVALID_NAME_CHARS.contains(&ch) || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();
    cleaned = cleaned.trim().trim_matches('.').trim().to_string();
    if cleaned.len() > MAX_NAME_LEN {
        cleaned.truncate(MAX_NAME_LEN);
    }
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Path of the torrent's payload relative to the staging root. The engine
/// places multi-file payloads under a sub-folder named after the torrent.
#[must_use]
pub fn staging_relative(torrent_name: &str, multi_file: bool, file_path: &str) -> PathBuf {
    if multi_file {
        Path::new(torrent_name).join(file_path)
    } else {
        PathBuf::from(file_path)
    }
}

/// Join `relative` onto `root` and require the result to stay inside `root`
/// after canonicalisation. The target must exist.
///
/// # Errors
///
/// Returns an error for missing targets and for any join that escapes the
/// root.
pub fn guarded_join(root: &Path, relative: &Path) -> Result<PathBuf> {
    let root = root.canonicalize()?;
    let joined = root.join(relative);
    let resolved = joined.canonicalize()?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(CoreError::invalid(format!(
            "path {relative:?} escapes the download directory"
        )))
    }
}

/// Build `<staging>/<sanitised-name>.zip` from the regular files under the
/// torrent's payload root. Entry names are the paths relative to that root.
///
/// # Errors
///
/// Returns an error when the payload root is missing, escapes the staging
/// directory, or the archive cannot be written.
pub fn build_archive(staging_root: &Path, torrent_name: &str) -> Result<(String, i64)> {
    let payload_root = guarded_join(staging_root, Path::new(torrent_name))?;
    let archive_name = format!("{}.zip", sanitize_archive_name(torrent_name));
    let archive_path = staging_root.join(&archive_name);

    let file = File::create(&archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options: FileOptions = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let canonical_root = payload_root.canonicalize()?;
    for entry in WalkDir::new(&payload_root).follow_links(false) {
        let entry = entry.map_err(|err| {
            CoreError::invalid(format!("failed to walk payload tree: {err}"))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        // Regular files only, and only ones that resolve inside the payload.
        let resolved = path.canonicalize()?;
        if !resolved.starts_with(&canonical_root) {
            warn!(path = %path.display(), "skipping entry outside the payload root");
            continue;
        }
        let relative = path
            .strip_prefix(&payload_root)
            .map_err(|_| CoreError::invalid("walked entry outside the payload root"))?;
        let entry_name = relative.to_string_lossy().replace('\\', "/");
        writer
            .start_file(entry_name, options)
            .map_err(|err| CoreError::invalid(format!("zip entry failed: {err}")))?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut writer)?;
    }

    writer
        .finish()
        .map_err(|err| CoreError::invalid(format!("zip finalisation failed: {err}")))?;

    let zip_size = std::fs::metadata(&archive_path)?.len();
    Ok((archive_name, i64::try_from(zip_size).unwrap_or(i64::MAX)))
}

/// Runs archive builds off the reducer's commit path, at most one per record.
pub struct Packager {
    store: Store,
    staging_root: PathBuf,
    active: Mutex<HashSet<Uuid>>,
}

impl Packager {
    /// Create a packager writing archives under `staging_root`.
    #[must_use]
    pub fn new(store: Store, staging_root: PathBuf) -> Self {
        Self {
            store,
            staging_root,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Schedule packaging for a completed multi-file torrent. A record with a
    /// build already in flight is left alone.
    pub fn schedule(self: &Arc<Self>, torrent_id: Uuid, torrent_name: String) {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(torrent_id) {
                return;
            }
        }
        let packager = Arc::clone(self);
        tokio::spawn(async move {
            packager.run_one(torrent_id, torrent_name).await;
            packager
                .active
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&torrent_id);
        });
    }

    async fn run_one(&self, torrent_id: Uuid, torrent_name: String) {
        let staging_root = self.staging_root.clone();
        let name = torrent_name.clone();
        let built = tokio::task::spawn_blocking(move || build_archive(&staging_root, &name)).await;
        match built {
            Ok(Ok((zip_path, zip_size))) => {
                info!(%torrent_id, zip_path, zip_size, "archive packaged");
                if let Err(err) = self
                    .store
                    .set_torrent_archive(torrent_id, &zip_path, zip_size)
                    .await
                {
                    warn!(%torrent_id, error = %err, "failed to persist archive path");
                }
            }
            Ok(Err(err)) => {
                // The record stays completed; the archive is a convenience.
                warn!(%torrent_id, error = %err, "archive packaging failed");
            }
            Err(err) => {
                warn!(%torrent_id, error = %err, "archive packaging task panicked");
            }
        }
    }

    /// Whether a build is currently in flight for the record.
    #[must_use]
    pub fn is_active(&self, torrent_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&torrent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitisation_replaces_reserved_characters() {
        assert_eq!(sanitize_archive_name("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn sanitisation_trims_whitespace_and_dots() {
        assert_eq!(sanitize_archive_name("  ..movie pack.. "), "movie pack");
    }

    #[test]
    fn sanitisation_caps_length() {
        let long = "x".repeat(400);
        assert_eq!(sanitize_archive_name(&long).len(), 200);
    }

    #[test]
    fn sanitisation_falls_back_on_empty() {
        assert_eq!(sanitize_archive_name("  ...  "), "download");
        assert_eq!(sanitize_archive_name("////"), "____");
    }

    #[test]
    fn staging_relative_nests_multi_file_payloads() {
        assert_eq!(
            staging_relative("pack", true, "a/b.txt"),
            PathBuf::from("pack/a/b.txt")
        );
        assert_eq!(
            staging_relative("pack", false, "hello.bin"),
            PathBuf::from("hello.bin")
        );
    }

    #[test]
    fn guarded_join_rejects_escapes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("inside.txt"), b"ok").expect("fixture");

        assert!(guarded_join(dir.path(), Path::new("inside.txt")).is_ok());
        assert!(guarded_join(dir.path(), Path::new("../outside.txt")).is_err());
        assert!(guarded_join(dir.path(), Path::new("missing.txt")).is_err());
    }

    #[test]
    fn archive_contains_relative_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = dir.path().join("pack");
        std::fs::create_dir_all(payload.join("sub")).expect("payload dirs");
        std::fs::write(payload.join("a.txt"), b"aaaaaaaaaa").expect("fixture a");
        std::fs::write(payload.join("sub/b.txt"), b"bbbbbbbbbbbbbbbbbbbb").expect("fixture b");

        let (zip_path, zip_size) = build_archive(dir.path(), "pack").expect("archive builds");
        assert_eq!(zip_path, "pack.zip");
        assert!(zip_size > 0);

        let file = File::open(dir.path().join(&zip_path)).expect("archive opens");
        let mut archive = zip::ZipArchive::new(file).expect("archive parses");
        let mut names: Vec<String> = (0..archive.len())
            .map(|idx| archive.by_index(idx).expect("entry").name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.txt".to_string(), "sub/b.txt".to_string()]);
    }

    #[test]
    fn missing_payload_root_fails_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(build_archive(dir.path(), "nope").is_err());
    }
}
