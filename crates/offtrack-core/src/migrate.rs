//! Migration of downloads made before the current library layout.
//!
//! Legacy downloads are flat audio files named `<trackId>.<ext>` or
//! `<trackId>_<quality>.<ext>`, optionally next to a `<stem>.json` holding
//! the upstream track document.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::download::{StagedTrack, ensure_track_stored_from_staging};
use crate::error::{Error, Result};
use crate::index::LibraryIndex;
use crate::layout::{PathLayout, is_audio_file};
use crate::metadata::TrackMetadata;
use crate::model::Owner;
use crate::quality::Quality;
use crate::store::{read_json, remove_file_if_exists, stat};

static LEGACY_STEM: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:_([A-Za-z0-9_]+))?$"));

/// Pattern of a legacy file stem: `<trackId>` or `<trackId>_<quality>`.
fn legacy_stem() -> Result<&'static Regex> {
    LEGACY_STEM
        .as_ref()
        .map_err(|e| Error::Configuration(format!("Invalid legacy file name pattern: {e}")))
}

/// Counts reported by [`migrate_legacy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Files moved into the library.
    pub migrated: usize,
    /// Files left alone (unrecognized name or already stored).
    pub skipped: usize,
    /// Files that could not be moved.
    pub failed: usize,
}

/// Track id and tier encoded in a legacy file name.
fn parse_legacy_name(pattern: &Regex, path: &Path) -> Option<(u64, Quality)> {
    let stem = path.file_stem()?.to_str()?;
    let captures = pattern.captures(stem)?;
    let track_id: u64 = captures.get(1)?.as_str().parse().ok().filter(|id| *id > 0)?;
    let quality = match captures.get(2) {
        Some(raw) => Some(Quality::normalize(raw.as_str())).filter(Quality::is_known)?,
        None => {
            let extension = path.extension()?.to_str()?.to_lowercase();
            if extension == "flac" {
                Quality::Flac
            } else {
                Quality::Mp3_320
            }
        }
    };
    Some((track_id, quality))
}

fn sidecar_path(audio: &Path) -> PathBuf {
    audio.with_extension("json")
}

/// Whether `path` is part of the current layout.
fn is_library_path(layout: &PathLayout, path: &Path) -> bool {
    [
        layout.albums_dir(),
        layout.orphans_dir(),
        layout.playlists_dir(),
        layout.staging_root(),
    ]
    .iter()
    .any(|dir| path.starts_with(dir))
}

/// Move every legacy download under `legacy_dir` into the library.
///
/// Tracks go under their album when the sidecar names one, otherwise under
/// `orphans/`, owned ad hoc. A `(track, tier)` already stored is skipped and
/// its legacy file left in place.
pub fn migrate_legacy(index: &mut LibraryIndex, legacy_dir: &Path) -> Result<MigrationReport> {
    let pattern = legacy_stem()?;
    index.ensure_loaded()?;
    let layout = index.layout().clone();
    let mut report = MigrationReport::default();
    if !legacy_dir.is_dir() {
        debug!("No legacy directory at {}", legacy_dir.display());
        return Ok(report);
    }

    let candidates: Vec<PathBuf> = WalkDir::new(legacy_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_library_path(&layout, e.path()))
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| is_audio_file(p) && stat(p).is_some_and(|s| s.len > 0))
        .collect();

    for audio in candidates {
        let Some((track_id, quality)) = parse_legacy_name(pattern, &audio) else {
            debug!("Skipping unrecognized legacy file {}", audio.display());
            report.skipped += 1;
            continue;
        };
        if index.resolve_exact(track_id, &quality)?.is_some() {
            debug!("Track {} at {} already stored, skipping", track_id, quality);
            report.skipped += 1;
            continue;
        }

        let sidecar = sidecar_path(&audio);
        let mut track = read_json::<Value>(&sidecar)
            .and_then(|value| TrackMetadata::from_value(&value))
            .filter(|t| t.id == track_id)
            .unwrap_or_default();
        track.id = track_id;
        let album_id = track.album_id;

        let staged = StagedTrack {
            track: &track,
            album_id,
            album: None,
            quality: &quality,
            owner: &Owner::AdHoc,
            audio: &audio,
        };
        match ensure_track_stored_from_staging(index, &staged) {
            Ok(path) => {
                debug!("Migrated {} to {}", audio.display(), path.display());
                if let Err(e) = remove_file_if_exists(&sidecar) {
                    warn!("Could not remove legacy sidecar {}: {}", sidecar.display(), e);
                }
                report.migrated += 1;
            }
            Err(e) => {
                warn!("Failed to migrate {}: {}", audio.display(), e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Legacy migration: {} migrated, {} skipped, {} failed",
        report.migrated, report.skipped, report.failed
    );
    Ok(report)
}
