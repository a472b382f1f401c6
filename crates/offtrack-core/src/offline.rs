//! Offline tracklists: collection metadata merged with on-disk availability.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::index::LibraryIndex;
use crate::metadata::{AlbumMetadata, PlaylistMetadata, TrackMetadata};
use crate::model::{PlaylistItems, TrackDocument};
use crate::quality::Quality;
use crate::store::read_json;

/// A collection whose tracklist can be viewed offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Collection {
    /// An album.
    Album(u64),
    /// A playlist.
    Playlist(u64),
    /// Every downloaded album of an artist.
    Artist(u64),
}

/// One row of an offline tracklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineTrack {
    /// Track id.
    pub track_id: u64,
    /// Track title, if known.
    pub title: Option<String>,
    /// Artist name, if known.
    pub artist: Option<String>,
    /// Whether a valid audio file is available.
    pub downloaded: bool,
    /// Tier of the available file.
    pub quality: Option<Quality>,
    /// Available audio file.
    pub path: Option<PathBuf>,
}

/// A collection's tracks with their availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineTracklist {
    /// The collection.
    pub collection: Collection,
    /// Collection title, if known.
    pub title: Option<String>,
    /// Tracks in collection order.
    pub tracks: Vec<OfflineTrack>,
    /// Tracks available offline.
    pub downloaded_count: usize,
    /// Tracks in the collection.
    pub total_count: usize,
}

impl OfflineTracklist {
    fn new(collection: Collection, title: Option<String>, tracks: Vec<OfflineTrack>) -> Self {
        let downloaded_count = tracks.iter().filter(|t| t.downloaded).count();
        Self {
            collection,
            title,
            total_count: tracks.len(),
            downloaded_count,
            tracks,
        }
    }
}

/// Build the offline tracklist of `collection`.
///
/// Availability prefers `preferred` and falls back through the other tiers.
/// Stale index entries met along the way are pruned.
pub fn offline_tracklist(
    index: &mut LibraryIndex,
    collection: &Collection,
    preferred: Option<&Quality>,
) -> Result<OfflineTracklist> {
    index.ensure_loaded()?;
    match *collection {
        Collection::Album(album_id) => {
            let (title, tracks) = album_rows(index, album_id, preferred)?
                .ok_or_else(|| Error::not_found(format!("album {album_id}")))?;
            Ok(OfflineTracklist::new(*collection, title, tracks))
        }
        Collection::Playlist(playlist_id) => playlist_tracklist(index, playlist_id, preferred),
        Collection::Artist(artist_id) => artist_tracklist(index, artist_id, preferred),
    }
}

/// Title and rows of an album, `None` if nothing is known about it.
fn album_rows(
    index: &mut LibraryIndex,
    album_id: u64,
    preferred: Option<&Quality>,
) -> Result<Option<(Option<String>, Vec<OfflineTrack>)>> {
    let meta = read_json::<AlbumMetadata>(&index.layout().album_json(album_id));
    let entry = index.album(album_id)?.cloned();
    if meta.is_none() && entry.is_none() {
        return Ok(None);
    }

    let mut order = meta.as_ref().map(|m| m.track_ids.clone()).unwrap_or_default();
    if order.is_empty()
        && let Some(entry) = &entry
    {
        order = entry
            .all_track_ids
            .clone()
            .unwrap_or_else(|| entry.track_ids.clone());
    }
    let album_artist = meta
        .as_ref()
        .and_then(|m| m.artist_name.clone())
        .or_else(|| entry.as_ref().and_then(|e| e.artist.clone()));
    let title = meta
        .as_ref()
        .and_then(|m| m.title.clone())
        .or_else(|| entry.and_then(|e| e.title));

    let mut rows = Vec::with_capacity(order.len());
    for track_id in order {
        let known = meta.as_ref().and_then(|m| m.track(track_id));
        let mut row = track_row(index, track_id, known, preferred)?;
        if row.artist.is_none() {
            row.artist.clone_from(&album_artist);
        }
        rows.push(row);
    }
    Ok(Some((title, rows)))
}

fn playlist_tracklist(
    index: &mut LibraryIndex,
    playlist_id: u64,
    preferred: Option<&Quality>,
) -> Result<OfflineTracklist> {
    let layout = index.layout().clone();
    let meta = read_json::<PlaylistMetadata>(&layout.playlist_json(playlist_id));
    let items = read_json::<PlaylistItems>(&layout.playlist_items(playlist_id));
    let entry = index.playlist(playlist_id)?.cloned();
    if meta.is_none() && items.is_none() && entry.is_none() {
        return Err(Error::not_found(format!("playlist {playlist_id}")));
    }

    let candidates = [
        meta.as_ref().map(|m| m.track_ids.clone()),
        items.as_ref().map(|i| i.track_ids.clone()),
        entry.as_ref().map(|e| e.track_ids.clone()),
        items.as_ref().map(|i| i.downloads.keys().copied().collect()),
    ];
    let order = candidates
        .into_iter()
        .flatten()
        .find(|ids| !ids.is_empty())
        .unwrap_or_default();
    let title = meta
        .as_ref()
        .and_then(|m| m.title.clone())
        .or_else(|| entry.and_then(|e| e.title));

    let mut rows = Vec::with_capacity(order.len());
    for track_id in order {
        let known = meta.as_ref().and_then(|m| m.track(track_id));
        let mut row = track_row(index, track_id, known, preferred)?;
        if let Some(mirror) = index.playlist_download(playlist_id, track_id)? {
            row.downloaded = true;
            row.quality = Some(mirror.quality);
            row.path = Some(mirror.path);
        }
        rows.push(row);
    }
    Ok(OfflineTracklist::new(Collection::Playlist(playlist_id), title, rows))
}

fn artist_tracklist(
    index: &mut LibraryIndex,
    artist_id: u64,
    preferred: Option<&Quality>,
) -> Result<OfflineTracklist> {
    let layout = index.layout().clone();
    let albums: Vec<u64> = index
        .document()?
        .albums
        .values()
        .filter(|album| {
            album.artist_id == Some(artist_id)
                || read_json::<AlbumMetadata>(&layout.album_json(album.album_id))
                    .is_some_and(|m| m.artist_id == Some(artist_id))
        })
        .map(|album| album.album_id)
        .collect();

    let mut name = None;
    let mut rows = Vec::new();
    for album_id in albums {
        if let Some((_, tracks)) = album_rows(index, album_id, preferred)? {
            if name.is_none() {
                name = tracks.iter().find_map(|t| t.artist.clone());
            }
            rows.extend(tracks);
        }
    }
    if rows.is_empty() {
        return Err(Error::not_found(format!("artist {artist_id}")));
    }
    Ok(OfflineTracklist::new(Collection::Artist(artist_id), name, rows))
}

/// One row from embedded metadata, the track's sidecar and the index.
fn track_row(
    index: &mut LibraryIndex,
    track_id: u64,
    known: Option<&TrackMetadata>,
    preferred: Option<&Quality>,
) -> Result<OfflineTrack> {
    let mut metadata = known.cloned().unwrap_or_default();
    let sidecar = index
        .track(track_id)?
        .and_then(|t| t.metadata_path.clone())
        .and_then(|p| read_json::<TrackDocument>(&p));
    if let Some(sidecar) = sidecar {
        metadata.merge_missing(&sidecar.track);
    }

    let resolved = if index.track(track_id)?.is_some() {
        match index.resolve_track(track_id, preferred) {
            Ok(resolved) => Some(resolved),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    Ok(OfflineTrack {
        track_id,
        title: metadata.title,
        artist: metadata.artist_name,
        downloaded: resolved.is_some(),
        quality: resolved.as_ref().map(|r| r.quality.clone()),
        path: resolved.map(|r| r.path),
    })
}
