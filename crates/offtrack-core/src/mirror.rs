//! Playlist mirrors.
//!
//! A playlist holds its own reference to a downloaded track under
//! `playlists/<id>/tracks/<trackId>/<quality>/`. The reference is a hard link
//! when the filesystem allows it, and a full copy otherwise.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::index::LibraryIndex;
use crate::metadata::PlaylistMetadata;
use crate::model::{
    Owner, OwnershipTag, PlaylistDownload, PlaylistEntry, PlaylistItems, QualityEntry, TrackEntry,
};
use crate::quality::Quality;
use crate::store::{
    ensure_dir, now_millis, read_json, remove_file_if_exists, stat, write_json_atomic,
};

/// How a mirror file came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorMethod {
    /// The mirror was already in place.
    Existing,
    /// Hard link sharing the source's bytes.
    HardLink,
    /// Independent copy.
    Copy,
}

/// One way of placing `source` at `destination`.
#[cfg_attr(test, mockall::automock)]
pub trait LinkStrategy: Send + Sync {
    /// Method reported when this strategy succeeds.
    fn method(&self) -> MirrorMethod;

    /// Create `destination` from `source`. `destination` does not exist yet.
    fn place(&self, source: &Path, destination: &Path) -> io::Result<()>;
}

/// Hard link strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HardLink;

impl LinkStrategy for HardLink {
    fn method(&self) -> MirrorMethod {
        MirrorMethod::HardLink
    }

    fn place(&self, source: &Path, destination: &Path) -> io::Result<()> {
        fs::hard_link(source, destination)
    }
}

/// Full copy strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyFile;

impl LinkStrategy for CopyFile {
    fn method(&self) -> MirrorMethod {
        MirrorMethod::Copy
    }

    fn place(&self, source: &Path, destination: &Path) -> io::Result<()> {
        fs::copy(source, destination).map(|_| ())
    }
}

/// Try each strategy in order, returning the first that succeeds.
///
/// On total failure the error lists every strategy's reason.
pub fn link_or_copy(
    strategies: &[Box<dyn LinkStrategy>],
    source: &Path,
    destination: &Path,
) -> std::result::Result<MirrorMethod, String> {
    let mut reasons = Vec::new();
    for strategy in strategies {
        match strategy.place(source, destination) {
            Ok(()) => return Ok(strategy.method()),
            Err(e) => {
                debug!(
                    "{:?} of {} failed: {}",
                    strategy.method(),
                    source.display(),
                    e
                );
                // A failed attempt may leave a partial file behind.
                let _ = fs::remove_file(destination);
                reasons.push(format!("{:?}: {e}", strategy.method()));
            }
        }
    }
    Err(reasons.join("; "))
}

/// Result of mirroring a track into a playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorResult {
    /// Mirror audio file.
    pub path: PathBuf,
    /// How it was created.
    pub method: MirrorMethod,
}

/// Creates playlist mirrors and keeps `items.json` and the index in step.
pub struct PlaylistMirror {
    strategies: Vec<Box<dyn LinkStrategy>>,
}

impl Default for PlaylistMirror {
    fn default() -> Self {
        Self {
            strategies: vec![Box::new(HardLink), Box::new(CopyFile)],
        }
    }
}

impl std::fmt::Debug for PlaylistMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistMirror")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}

impl PlaylistMirror {
    /// Mirror with custom strategies, tried in order.
    #[must_use]
    pub fn with_strategies(strategies: Vec<Box<dyn LinkStrategy>>) -> Self {
        Self { strategies }
    }

    /// Make sure `playlist_id` holds a mirror of `source` for `track_id`.
    ///
    /// Records the mirror in the playlist's `items.json`, writes
    /// `playlist.json` if it is missing and `playlist` is given, tags the
    /// track with the playlist as an owner, and saves the index.
    pub fn ensure_playlist_track_mirror(
        &self,
        index: &mut LibraryIndex,
        playlist_id: u64,
        track_id: u64,
        quality: &Quality,
        source: &Path,
        playlist: Option<&PlaylistMetadata>,
    ) -> Result<MirrorResult> {
        if !stat(source).is_some_and(|s| s.is_non_empty_file()) {
            return Err(Error::not_found(format!(
                "source audio {} for track {}",
                source.display(),
                track_id
            )));
        }
        index.ensure_loaded()?;
        let layout = index.layout().clone();

        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_else(|| quality.default_extension());
        let destination = layout.playlist_audio_path(playlist_id, track_id, quality, extension);
        let mirror_failed = |reason: String| Error::MirrorFailed {
            playlist_id,
            track_id,
            reason,
        };

        let method = if destination == source
            || stat(&destination).is_some_and(|s| s.is_non_empty_file())
        {
            MirrorMethod::Existing
        } else {
            remove_file_if_exists(&destination)?;
            if let Some(parent) = destination.parent() {
                ensure_dir(parent).map_err(|e| mirror_failed(e.to_string()))?;
            }
            link_or_copy(&self.strategies, source, &destination).map_err(mirror_failed)?
        };

        let items_path = layout.playlist_items(playlist_id);
        let mut items = read_json::<PlaylistItems>(&items_path)
            .unwrap_or_else(|| PlaylistItems::new(playlist_id));
        if items.track_ids.is_empty()
            && let Some(meta) = playlist
        {
            items.track_ids.clone_from(&meta.track_ids);
        }
        if !items.track_ids.contains(&track_id) {
            items.track_ids.push(track_id);
        }
        items.downloads.insert(
            track_id,
            PlaylistDownload {
                path: destination.clone(),
                quality: quality.clone(),
                downloaded_at: now_millis(),
            },
        );
        write_json_atomic(&items_path, &items)?;

        let playlist_json = layout.playlist_json(playlist_id);
        if let Some(meta) = playlist
            && !playlist_json.exists()
        {
            write_json_atomic(&playlist_json, meta)?;
        }

        let mut entry = PlaylistEntry::new(playlist_id);
        entry.title = playlist.and_then(|m| m.title.clone());
        entry.metadata_path = playlist_json.exists().then_some(playlist_json);
        entry.items_path = Some(items_path);
        entry.track_ids.clone_from(&items.track_ids);
        index.upsert_playlist(entry)?;

        let tag = OwnershipTag::new(Owner::Playlist { playlist_id }, quality);
        let indexed = index
            .track(track_id)?
            .is_some_and(|t| t.qualities.contains_key(quality));
        if indexed {
            index.stamp_owner(track_id, quality, tag)?;
        } else {
            warn!(
                "Track {} at {} is not indexed, indexing its playlist {} mirror",
                track_id, quality, playlist_id
            );
            let (size, modified_ms) =
                stat(&destination).map_or((0, 0), |s| (s.len, s.modified_ms));
            let mut patch = TrackEntry::new(track_id);
            patch.qualities.insert(
                quality.clone(),
                QualityEntry {
                    path: destination.clone(),
                    owners: vec![tag],
                    size,
                    modified_ms,
                },
            );
            index.upsert_track(patch)?;
        }
        index.save()?;

        info!(
            "Mirrored track {} ({}) into playlist {} via {:?}",
            track_id, quality, playlist_id, method
        );
        Ok(MirrorResult {
            path: destination,
            method,
        })
    }
}
