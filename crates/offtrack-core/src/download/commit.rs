//! Commit of a staged audio file into canonical storage.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::LibraryIndex;
use crate::metadata::{AlbumMetadata, TrackMetadata};
use crate::model::{
    AlbumEntry, Owner, OwnershipTag, QualityEntry, TrackDocument, TrackEntry, add_owner,
};
use crate::layout::is_audio_file;
use crate::quality::Quality;
use crate::store::{
    is_non_empty_file, move_file, now_millis, read_json, remove_file_if_exists, stat,
    write_json_atomic,
};

/// A finished staging result waiting to be committed.
#[derive(Debug, Clone, Copy)]
pub struct StagedTrack<'a> {
    /// Normalized track metadata.
    pub track: &'a TrackMetadata,
    /// Album the track is stored under. `None` stores it under `orphans/`.
    pub album_id: Option<u64>,
    /// Album metadata, cached as `album.json` when not already present.
    pub album: Option<&'a AlbumMetadata>,
    /// Stored tier.
    pub quality: &'a Quality,
    /// Context the track was downloaded for.
    pub owner: &'a Owner,
    /// Staged audio file.
    pub audio: &'a Path,
}

/// Move staged audio to its canonical path, cache its metadata and record
/// it in the index.
///
/// Target paths come from the layout and the entry is merged into whatever
/// index is current, so a rescan that ran while the job was staging is
/// harmless. Running the same commit twice leaves one file and one entry:
/// if the staged file is gone but the canonical file exists, only the index
/// side is (re)applied.
pub fn ensure_track_stored_from_staging(
    index: &mut LibraryIndex,
    staged: &StagedTrack<'_>,
) -> Result<PathBuf> {
    index.ensure_loaded()?;
    let layout = index.layout().clone();
    let track_id = staged.track.id;
    let quality = staged.quality;

    let extension = staged
        .audio
        .extension()
        .and_then(|e| e.to_str())
        .map_or_else(|| quality.default_extension().to_string(), str::to_lowercase);
    let target = layout.track_audio_path(staged.album_id, track_id, quality, &extension);

    if is_non_empty_file(staged.audio) {
        if staged.audio != target.as_path() {
            remove_stale_variants(&target)?;
            move_file(staged.audio, &target)?;
        }
    } else if is_non_empty_file(&target) {
        debug!(
            "Staged audio for track {} already committed at {}",
            track_id,
            target.display()
        );
    } else {
        return Err(Error::NoAudioFile {
            staging: staged
                .audio
                .parent()
                .map_or_else(PathBuf::new, Path::to_path_buf),
        });
    }

    let tag = OwnershipTag::new(staged.owner.clone(), quality);
    let sidecar_path = layout.track_json(staged.album_id, track_id, quality);
    let document = match read_json::<TrackDocument>(&sidecar_path) {
        Some(mut existing) => {
            existing.track.merge_missing(staged.track);
            add_owner(&mut existing.owners, tag);
            existing.quality = quality.clone();
            existing
        }
        None => TrackDocument {
            track: staged.track.clone(),
            quality: quality.clone(),
            owners: vec![tag],
            downloaded_at: now_millis(),
        },
    };
    write_json_atomic(&sidecar_path, &document)?;

    let cover_path = staged
        .album_id
        .map(|id| layout.album_cover(id))
        .filter(|p| is_non_empty_file(p));
    if let Some(album_id) = staged.album_id {
        let album_json = layout.album_json(album_id);
        let album_meta = staged
            .album
            .filter(|a| a.id == album_id)
            .cloned()
            .or_else(|| AlbumMetadata::from_track(staged.track));
        if !album_json.exists()
            && let Some(meta) = &album_meta
        {
            write_json_atomic(&album_json, meta)?;
        }

        let mut album = AlbumEntry::new(album_id);
        if let Some(meta) = album_meta {
            album.title = meta.title;
            album.artist = meta.artist_name;
            album.artist_id = meta.artist_id;
            album.all_track_ids = (!meta.track_ids.is_empty()).then_some(meta.track_ids);
        }
        album.metadata_path = album_json.exists().then_some(album_json);
        album.cover_path.clone_from(&cover_path);
        album.track_ids = vec![track_id];
        index.upsert_album(album)?;
    }

    let (size, modified_ms) = stat(&target).map_or((0, 0), |s| (s.len, s.modified_ms));
    let mut entry = TrackEntry::new(track_id);
    entry.album_id = staged.album_id;
    entry.metadata_path = Some(sidecar_path);
    entry.cover_path = cover_path;
    entry.qualities.insert(
        quality.clone(),
        QualityEntry {
            path: target.clone(),
            owners: document.owners,
            size,
            modified_ms,
        },
    );
    index.upsert_track(entry)?;
    index.save()?;

    info!(
        "Committed track {} at {} to {}",
        track_id,
        quality,
        target.display()
    );
    Ok(target)
}

/// Remove audio files next to `target` with another extension, so a tier
/// directory never holds two audio files.
fn remove_stale_variants(target: &Path) -> Result<()> {
    let Some(dir) = target.parent() else {
        return Ok(());
    };
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };
    for path in entries.flatten().map(|e| e.path()) {
        if path != target && is_audio_file(&path) {
            debug!("Replacing previous audio file {}", path.display());
            remove_file_if_exists(&path)?;
        }
    }
    Ok(())
}
