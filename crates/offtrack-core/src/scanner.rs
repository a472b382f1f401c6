//! Library scanner: rebuilds the index from the on-disk tree.
//!
//! Only the filesystem is trusted. Albums are scanned first, then orphans, then
//! playlist mirrors; a later tree only adds tiers the earlier ones did not
//! provide, and otherwise just contributes its ownership tag.

use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::layout::{PathLayout, TRACK_FILE, is_audio_file};
use crate::metadata::{AlbumMetadata, PlaylistMetadata};
use crate::model::{
    AlbumEntry, IndexDocument, OwnershipTag, Owner, PlaylistEntry, PlaylistItems, QualityEntry,
    TrackDocument, TrackEntry, add_owner,
};
use crate::quality::Quality;
use crate::store::{child_dirs, dir_id, now_millis, read_json, stat};

/// First non-empty audio file under `dir`, searching at most `max_depth`
/// levels deep. Entries are visited in file name order.
pub(crate) fn find_audio_file(dir: &Path, max_depth: usize) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .find(|p| is_audio_file(p) && stat(p).is_some_and(|s| s.len > 0))
}

/// Whether any downloaded audio exists under the content trees.
pub fn has_downloaded_audio(layout: &PathLayout) -> bool {
    [layout.albums_dir(), layout.orphans_dir(), layout.playlists_dir()]
        .iter()
        .any(|dir| dir.is_dir() && find_audio_file(dir, 5).is_some())
}

/// Walk the library tree and build a fresh index document.
pub fn scan_library(layout: &PathLayout) -> IndexDocument {
    let mut doc = IndexDocument {
        updated_at: now_millis(),
        ..IndexDocument::default()
    };

    for album_dir in child_dirs(&layout.albums_dir()) {
        if let Some(album_id) = dir_id(&album_dir) {
            scan_album(layout, &mut doc, album_id);
        }
    }

    for track_dir in child_dirs(&layout.orphans_dir()) {
        if let Some(track_id) = dir_id(&track_dir) {
            scan_track_dir(&mut doc, &track_dir, track_id, None, None);
        }
    }

    for playlist_dir in child_dirs(&layout.playlists_dir()) {
        if let Some(playlist_id) = dir_id(&playlist_dir) {
            scan_playlist(layout, &mut doc, playlist_id);
        }
    }

    info!(
        "Scanned library at {}: {} tracks, {} albums, {} playlists",
        layout.root().display(),
        doc.tracks.len(),
        doc.albums.len(),
        doc.playlists.len()
    );
    doc
}

fn scan_album(layout: &PathLayout, doc: &mut IndexDocument, album_id: u64) {
    let album_dir = layout.album_dir(album_id);
    let tracks_dir = album_dir.join("tracks");
    let cover = layout.album_cover(album_id);
    let cover_path = stat(&cover)
        .is_some_and(|s| s.is_non_empty_file())
        .then_some(cover);

    let mut track_ids = Vec::new();
    for track_dir in child_dirs(&tracks_dir) {
        let Some(track_id) = dir_id(&track_dir) else {
            continue;
        };
        let fallback = Owner::Album { album_id };
        if scan_track_dir(doc, &track_dir, track_id, Some(album_id), Some(&fallback)) {
            if let Some(entry) = doc.tracks.get_mut(&track_id) {
                entry.cover_path.clone_from(&cover_path);
            }
            track_ids.push(track_id);
        }
    }

    if track_ids.is_empty() {
        debug!("Album {} has no audio on disk, skipping", album_id);
        return;
    }

    let album_json = layout.album_json(album_id);
    let meta = read_json::<AlbumMetadata>(&album_json);
    let mut entry = AlbumEntry::new(album_id);
    if let Some(meta) = meta {
        entry.title = meta.title;
        entry.artist = meta.artist_name;
        entry.artist_id = meta.artist_id;
        entry.all_track_ids = (!meta.track_ids.is_empty()).then_some(meta.track_ids);
        entry.metadata_path = Some(album_json);
    }
    entry.cover_path = cover_path;
    entry.track_ids = track_ids;
    doc.albums.insert(album_id, entry);
}

/// Index every `<quality>/` directory under `track_dir`.
///
/// Owners come from each tier's `track.json`; when none are recorded,
/// `fallback` (if any) is used. Returns whether any tier was found.
fn scan_track_dir(
    doc: &mut IndexDocument,
    track_dir: &Path,
    track_id: u64,
    album_id: Option<u64>,
    fallback: Option<&Owner>,
) -> bool {
    let mut found = false;
    for quality_dir in child_dirs(track_dir) {
        let Some(name) = quality_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let quality = Quality::normalize(name);
        let Some(audio) = find_audio_file(&quality_dir, 1) else {
            continue;
        };

        let sidecar_path = quality_dir.join(TRACK_FILE);
        let sidecar = read_json::<TrackDocument>(&sidecar_path);
        let mut owners = sidecar.as_ref().map(|s| s.owners.clone()).unwrap_or_default();
        if owners.is_empty()
            && let Some(owner) = fallback
        {
            owners.push(OwnershipTag::new(owner.clone(), &quality));
        }

        let entry = doc
            .tracks
            .entry(track_id)
            .or_insert_with(|| TrackEntry::new(track_id));
        if entry.album_id.is_none() {
            entry.album_id = album_id;
        }
        if entry.metadata_path.is_none() && sidecar.is_some() {
            entry.metadata_path = Some(sidecar_path);
        }
        if let Some(existing) = entry.qualities.get_mut(&quality) {
            for tag in owners {
                add_owner(&mut existing.owners, tag);
            }
        } else {
            let (size, modified_ms) = stat(&audio).map_or((0, 0), |s| (s.len, s.modified_ms));
            entry.qualities.insert(
                quality,
                QualityEntry {
                    path: audio,
                    owners,
                    size,
                    modified_ms,
                },
            );
        }
        found = true;
    }
    found
}

fn scan_playlist(layout: &PathLayout, doc: &mut IndexDocument, playlist_id: u64) {
    let playlist_json = layout.playlist_json(playlist_id);
    let items_json = layout.playlist_items(playlist_id);
    let meta = read_json::<PlaylistMetadata>(&playlist_json);
    let items = read_json::<PlaylistItems>(&items_json);

    let mut mirrored = Vec::new();
    let tracks_dir = layout.playlist_dir(playlist_id).join("tracks");
    for track_dir in child_dirs(&tracks_dir) {
        let Some(track_id) = dir_id(&track_dir) else {
            continue;
        };
        let owner = Owner::Playlist { playlist_id };
        if mirror_track_dir(doc, &track_dir, track_id, &owner) {
            mirrored.push(track_id);
        }
    }

    if meta.is_none() && items.is_none() && mirrored.is_empty() {
        return;
    }

    let mut entry = PlaylistEntry::new(playlist_id);
    entry.track_ids = meta
        .as_ref()
        .map(|m| m.track_ids.clone())
        .filter(|ids| !ids.is_empty())
        .or_else(|| {
            items
                .as_ref()
                .map(|i| i.track_ids.clone())
                .filter(|ids| !ids.is_empty())
        })
        .unwrap_or_default();
    for track_id in mirrored {
        if !entry.track_ids.contains(&track_id) {
            entry.track_ids.push(track_id);
        }
    }
    if let Some(meta) = meta {
        entry.title = meta.title;
        entry.metadata_path = Some(playlist_json);
    }
    if items.is_some() {
        entry.items_path = Some(items_json);
    }
    doc.playlists.insert(playlist_id, entry);
}

/// Playlist mirrors always carry a synthesized playlist tag, even when the
/// tier is already indexed from the album tree.
fn mirror_track_dir(doc: &mut IndexDocument, track_dir: &Path, track_id: u64, owner: &Owner) -> bool {
    let mut found = false;
    for quality_dir in child_dirs(track_dir) {
        let Some(name) = quality_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let quality = Quality::normalize(name);
        let Some(audio) = find_audio_file(&quality_dir, 1) else {
            continue;
        };
        let tag = OwnershipTag::new(owner.clone(), &quality);
        let entry = doc
            .tracks
            .entry(track_id)
            .or_insert_with(|| TrackEntry::new(track_id));
        if let Some(existing) = entry.qualities.get_mut(&quality) {
            add_owner(&mut existing.owners, tag);
        } else {
            let (size, modified_ms) = stat(&audio).map_or((0, 0), |s| (s.len, s.modified_ms));
            entry.qualities.insert(
                quality,
                QualityEntry {
                    path: audio,
                    owners: vec![tag],
                    size,
                    modified_ms,
                },
            );
        }
        found = true;
    }
    found
}
