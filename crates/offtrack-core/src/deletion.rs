//! Removal of tracks, albums and playlists from disk and index.
//!
//! Track removal is incremental. Album and playlist removal delete whole
//! trees and then rebuild the index from disk.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::LibraryIndex;
use crate::layout::PathLayout;
use crate::model::{Owner, PlaylistDownload, PlaylistItems};
use crate::quality::Quality;
use crate::scanner::find_audio_file;
use crate::store::{
    child_dirs, dir_id, is_non_empty_file, read_json, remove_dir_all_if_exists,
    remove_empty_dirs_upward, stat, write_json_atomic,
};

/// Which tiers of a track to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySelector {
    /// One tier.
    One(Quality),
    /// Every stored tier.
    All,
}

/// What [`remove_download_for_track`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalReport {
    /// Track id.
    pub track_id: u64,
    /// Tiers removed.
    pub qualities_removed: Vec<Quality>,
    /// Whether the track left the index.
    pub track_removed: bool,
    /// Playlists whose mirror or downloads entry was dropped.
    pub playlists_pruned: Vec<u64>,
    /// Whether the album directory was removed.
    pub album_removed: bool,
}

/// Outcome of [`delete_playlist_from_disk`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistDeletion {
    /// Playlist id.
    pub playlist_id: u64,
    /// Tracks whose canonical audio was deleted with the playlist.
    pub deleted_tracks: Vec<u64>,
    /// Tracks left in place because another context still owns them.
    pub kept_tracks: Vec<u64>,
}

/// Remove a tier directory and the directories it leaves empty.
fn remove_tier_dir(layout: &PathLayout, dir: &Path) -> Result<()> {
    if remove_dir_all_if_exists(dir)? {
        debug!("Removed {}", dir.display());
    }
    if let (Some(parent), Some(stop)) = (dir.parent(), layout.container_root(dir)) {
        remove_empty_dirs_upward(parent, &stop);
    }
    Ok(())
}

/// Drop mirrors of `track_id` from every playlist: the `quality` tier only,
/// or every tier when `quality` is `None`.
///
/// A downloads entry left pointing at a removed mirror is repointed to a
/// remaining mirror tier, or dropped when none is left.
fn prune_from_playlists(
    layout: &PathLayout,
    track_id: u64,
    quality: Option<&Quality>,
) -> Result<Vec<u64>> {
    let mut pruned = Vec::new();
    for playlist_dir in child_dirs(&layout.playlists_dir()) {
        let Some(playlist_id) = dir_id(&playlist_dir) else {
            continue;
        };
        let mut touched = false;
        let track_dir = layout.playlist_track_dir(playlist_id, track_id);
        let mirror = quality.map_or_else(|| track_dir.clone(), |q| track_dir.join(q.as_str()));
        if remove_dir_all_if_exists(&mirror)? {
            if let Some(parent) = mirror.parent() {
                remove_empty_dirs_upward(parent, &playlist_dir);
            }
            touched = true;
        }

        let items_path = layout.playlist_items(playlist_id);
        if let Some(mut items) = read_json::<PlaylistItems>(&items_path)
            && items
                .downloads
                .get(&track_id)
                .is_some_and(|d| !is_non_empty_file(&d.path))
        {
            match remaining_mirror(&track_dir) {
                Some(download) => {
                    items.downloads.insert(track_id, download);
                }
                None => {
                    items.downloads.remove(&track_id);
                }
            }
            write_json_atomic(&items_path, &items)?;
            touched = true;
        }

        if touched {
            debug!("Pruned track {} from playlist {}", track_id, playlist_id);
            pruned.push(playlist_id);
        }
    }
    Ok(pruned)
}

/// First mirror tier still holding audio under a playlist track directory.
fn remaining_mirror(track_dir: &Path) -> Option<PlaylistDownload> {
    child_dirs(track_dir).into_iter().find_map(|dir| {
        let quality = Quality::normalize(dir.file_name()?.to_str()?);
        let path = find_audio_file(&dir, 1)?;
        Some(PlaylistDownload {
            downloaded_at: stat(&path).map_or(0, |s| s.modified_ms),
            path,
            quality,
        })
    })
}

/// Remove one or all tiers of a track.
///
/// Tier directories are deleted and empty parents cleaned up to the album
/// (or orphans) root. Playlist mirrors of each removed tier go too, so a
/// rescan cannot bring the tier back. With `delete_album_container` an album
/// left without downloaded tracks is removed as well.
pub fn remove_download_for_track(
    index: &mut LibraryIndex,
    track_id: u64,
    selector: &QualitySelector,
    delete_album_container: bool,
) -> Result<RemovalReport> {
    index.ensure_loaded()?;
    let layout = index.layout().clone();
    let entry = index
        .track(track_id)?
        .cloned()
        .ok_or_else(|| Error::not_found(format!("track {track_id}")))?;

    let qualities: Vec<Quality> = match selector {
        QualitySelector::All => entry.qualities.keys().cloned().collect(),
        QualitySelector::One(quality) if entry.qualities.contains_key(quality) => {
            vec![quality.clone()]
        }
        QualitySelector::One(quality) => {
            return Err(Error::not_found(format!("track {track_id} at {quality}")));
        }
    };

    let mut report = RemovalReport {
        track_id,
        ..RemovalReport::default()
    };
    let mut pruned = BTreeSet::new();
    for quality in qualities {
        let canonical = layout.track_quality_dir(entry.album_id, track_id, &quality);
        let recorded = entry.qualities[&quality].path.parent().map(Path::to_path_buf);
        for dir in recorded.into_iter().chain([canonical]) {
            remove_tier_dir(&layout, &dir)?;
        }
        pruned.extend(prune_from_playlists(&layout, track_id, Some(&quality))?);
        report.track_removed |= index.remove_quality(track_id, &quality)?;
        report.qualities_removed.push(quality);
    }

    if report.track_removed {
        pruned.extend(prune_from_playlists(&layout, track_id, None)?);
        if delete_album_container
            && let Some(album_id) = entry.album_id
            && index.album(album_id)?.is_none()
        {
            report.album_removed = remove_dir_all_if_exists(&layout.album_dir(album_id))?;
        }
    }
    report.playlists_pruned = pruned.into_iter().collect();
    index.save()?;

    info!(
        "Removed {} tier(s) of track {} (track removed: {})",
        report.qualities_removed.len(),
        track_id,
        report.track_removed
    );
    Ok(report)
}

/// Delete an album directory and rebuild the index from disk.
///
/// Playlist mirrors of the album's tracks are separate files and survive.
pub fn delete_album_from_disk(index: &mut LibraryIndex, album_id: u64) -> Result<()> {
    index.ensure_loaded()?;
    let dir = index.layout().album_dir(album_id);
    if !dir.exists() && index.album(album_id)?.is_none() {
        return Err(Error::not_found(format!("album {album_id}")));
    }
    remove_dir_all_if_exists(&dir)?;
    info!("Deleted album {} from disk", album_id);
    index.rescan()
}

/// Delete a playlist directory and rebuild the index from disk.
///
/// A member track's canonical audio goes with it only when every stored
/// tier is owned by this playlist alone and no other playlist lists it in
/// its downloads.
pub fn delete_playlist_from_disk(
    index: &mut LibraryIndex,
    playlist_id: u64,
) -> Result<PlaylistDeletion> {
    index.ensure_loaded()?;
    let layout = index.layout().clone();
    let playlist_dir = layout.playlist_dir(playlist_id);
    let entry = index.playlist(playlist_id)?.cloned();
    if !playlist_dir.exists() && entry.is_none() {
        return Err(Error::not_found(format!("playlist {playlist_id}")));
    }

    let owner = Owner::Playlist { playlist_id };
    let mut members: BTreeSet<u64> = entry
        .map(|e| e.track_ids)
        .unwrap_or_default()
        .into_iter()
        .collect();
    if let Some(items) = read_json::<PlaylistItems>(&layout.playlist_items(playlist_id)) {
        members.extend(items.track_ids);
        members.extend(items.downloads.into_keys());
    }
    members.extend(
        index
            .document()?
            .tracks
            .values()
            .filter(|t| t.has_owner(&owner))
            .map(|t| t.track_id),
    );

    let elsewhere: BTreeSet<u64> = child_dirs(&layout.playlists_dir())
        .iter()
        .filter_map(|dir| dir_id(dir))
        .filter(|id| *id != playlist_id)
        .filter_map(|id| read_json::<PlaylistItems>(&layout.playlist_items(id)))
        .flat_map(|items| items.downloads.into_keys())
        .collect();

    let mut report = PlaylistDeletion {
        playlist_id,
        ..PlaylistDeletion::default()
    };
    for track_id in members {
        let Some(track) = index.track(track_id)?.cloned() else {
            continue;
        };
        if !track.is_exclusively_owned_by_playlist(playlist_id) || elsewhere.contains(&track_id) {
            report.kept_tracks.push(track_id);
            continue;
        }
        for (quality, stored) in &track.qualities {
            let canonical = layout.track_quality_dir(track.album_id, track_id, quality);
            let recorded = stored
                .path
                .parent()
                .filter(|dir| !dir.starts_with(&playlist_dir))
                .map(Path::to_path_buf);
            for dir in recorded.into_iter().chain([canonical]) {
                remove_tier_dir(&layout, &dir)?;
            }
        }
        report.deleted_tracks.push(track_id);
    }

    remove_dir_all_if_exists(&playlist_dir)?;
    info!(
        "Deleted playlist {} from disk ({} tracks deleted, {} kept)",
        playlist_id,
        report.deleted_tracks.len(),
        report.kept_tracks.len()
    );
    index.rescan()?;
    Ok(report)
}
