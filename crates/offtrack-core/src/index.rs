//! The library index (`db.json`).
//!
//! The index is a cache over the on-disk tree. It is loaded lazily by
//! [`LibraryIndex::ensure_loaded`], rebuilt by the scanner whenever it is
//! missing, unreadable, from another schema version, or empty while audio
//! exists on disk. Stale quality entries are pruned on read.
//!
//! `upsert_*`, `remove_*` and `stamp_owner` mutate the in-memory document
//! only; every operation that uses them finishes with [`LibraryIndex::save`].

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layout::{PathLayout, TRACK_FILE};
use crate::model::{
    AlbumEntry, DownloadedPlaylist, DownloadedTrack, IndexDocument, Owner, OwnershipTag,
    PlaylistDownload, PlaylistEntry, PlaylistItems, ResolvedTrack, SCHEMA_VERSION, TrackDocument,
    TrackEntry, add_owner,
};
use crate::quality::{Quality, fallback_order};
use crate::scanner;
use crate::store::{is_non_empty_file, now_millis, read_json, stat, write_json_atomic};

/// Index shared between the orchestrator and the exposed operations.
pub type SharedIndex = Arc<RwLock<LibraryIndex>>;

/// Counts reported by [`LibraryIndex::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Quality entries dropped because their file is gone or empty.
    pub qualities_removed: usize,
    /// Tracks dropped because no quality remained.
    pub tracks_removed: usize,
    /// Albums dropped because no downloaded track remained.
    pub albums_removed: usize,
    /// Playlists dropped because their directory is gone.
    pub playlists_removed: usize,
}

/// In-memory view of `db.json` plus the layout it describes.
#[derive(Debug)]
pub struct LibraryIndex {
    layout: PathLayout,
    db: Option<IndexDocument>,
}

impl LibraryIndex {
    /// Create an unloaded index for the library at `layout`.
    #[must_use]
    pub const fn new(layout: PathLayout) -> Self {
        Self { layout, db: None }
    }

    /// Wrap into a [`SharedIndex`].
    #[must_use]
    pub fn shared(self) -> SharedIndex {
        Arc::new(RwLock::new(self))
    }

    /// Layout of the library this index describes.
    #[must_use]
    pub const fn layout(&self) -> &PathLayout {
        &self.layout
    }

    /// Whether a document is loaded.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        self.db.is_some()
    }

    /// The loaded document.
    pub fn document(&self) -> Result<&IndexDocument> {
        self.db.as_ref().ok_or(Error::DbNotLoaded)
    }

    fn document_mut(&mut self) -> Result<&mut IndexDocument> {
        self.db.as_mut().ok_or(Error::DbNotLoaded)
    }

    /// Load `db.json`, or rebuild it from disk when it cannot be trusted.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Ok(());
        }

        let db_path = self.layout.db_path();
        match read_json::<IndexDocument>(&db_path) {
            Some(doc) if doc.schema_version != SCHEMA_VERSION => {
                warn!(
                    "Index schema version {} does not match {}, rescanning",
                    doc.schema_version, SCHEMA_VERSION
                );
                self.rescan()
            }
            Some(doc) if doc.tracks.is_empty() && scanner::has_downloaded_audio(&self.layout) => {
                warn!("Index is empty but audio exists on disk, rescanning");
                self.rescan()
            }
            Some(doc) => {
                debug!(
                    "Loaded index with {} tracks from {}",
                    doc.tracks.len(),
                    db_path.display()
                );
                self.db = Some(doc);
                Ok(())
            }
            None => {
                info!("No usable index at {}, rescanning", db_path.display());
                self.rescan()
            }
        }
    }

    /// Replace the in-memory index with a fresh scan and persist it.
    pub fn rescan(&mut self) -> Result<()> {
        self.db = Some(scanner::scan_library(&self.layout));
        self.save()
    }

    /// Persist the whole index atomically, stamping `updated_at`.
    pub fn save(&mut self) -> Result<()> {
        let db_path = self.layout.db_path();
        let doc = self.document_mut()?;
        doc.updated_at = now_millis();
        write_json_atomic(&db_path, doc)
    }

    /// Track record by id.
    pub fn track(&self, track_id: u64) -> Result<Option<&TrackEntry>> {
        Ok(self.document()?.tracks.get(&track_id))
    }

    /// Album record by id.
    pub fn album(&self, album_id: u64) -> Result<Option<&AlbumEntry>> {
        Ok(self.document()?.albums.get(&album_id))
    }

    /// Playlist record by id.
    pub fn playlist(&self, playlist_id: u64) -> Result<Option<&PlaylistEntry>> {
        Ok(self.document()?.playlists.get(&playlist_id))
    }

    /// Resolve a track to a valid audio file, walking the fallback order.
    ///
    /// Stale tiers met along the way are pruned (and the whole track when none
    /// remain), and the index is saved if anything was pruned.
    pub fn resolve_track(
        &mut self,
        track_id: u64,
        preferred: Option<&Quality>,
    ) -> Result<ResolvedTrack> {
        let entry = self
            .document()?
            .tracks
            .get(&track_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("track {track_id}")))?;

        let mut stale = Vec::new();
        let mut resolved = None;
        for quality in fallback_order(preferred, entry.qualities.keys()) {
            let Some(q) = entry.qualities.get(&quality) else {
                continue;
            };
            match stat(&q.path).filter(|s| s.is_non_empty_file()) {
                Some(file) => {
                    resolved = Some(ResolvedTrack {
                        track_id,
                        album_id: entry.album_id,
                        quality,
                        path: q.path.clone(),
                        exists: true,
                        size: file.len,
                    });
                    break;
                }
                None => stale.push(quality),
            }
        }

        if !stale.is_empty() {
            for quality in &stale {
                warn!(
                    "Pruning stale {} entry of track {}: file missing or empty",
                    quality, track_id
                );
                self.remove_quality(track_id, quality)?;
            }
            self.save()?;
        }

        resolved.ok_or_else(|| Error::not_found(format!("audio for track {track_id}")))
    }

    /// Resolve exactly `(track_id, quality)`, pruning it if stale.
    pub fn resolve_exact(
        &mut self,
        track_id: u64,
        quality: &Quality,
    ) -> Result<Option<ResolvedTrack>> {
        let Some(entry) = self.document()?.tracks.get(&track_id) else {
            return Ok(None);
        };
        let album_id = entry.album_id;
        let Some(q) = entry.qualities.get(quality) else {
            return Ok(None);
        };
        if let Some(file) = stat(&q.path).filter(|s| s.is_non_empty_file()) {
            return Ok(Some(ResolvedTrack {
                track_id,
                album_id,
                quality: quality.clone(),
                path: q.path.clone(),
                exists: true,
                size: file.len,
            }));
        }

        warn!(
            "Pruning stale {} entry of track {}: file missing or empty",
            quality, track_id
        );
        self.remove_quality(track_id, quality)?;
        self.save()?;
        Ok(None)
    }

    /// Merge `patch` into the track record.
    ///
    /// `Some` fields replace, `None` fields are kept. Quality entries replace
    /// path, size and mtime, and union their owners.
    pub fn upsert_track(&mut self, patch: TrackEntry) -> Result<()> {
        let doc = self.document_mut()?;
        let entry = doc
            .tracks
            .entry(patch.track_id)
            .or_insert_with(|| TrackEntry::new(patch.track_id));
        if patch.album_id.is_some() {
            entry.album_id = patch.album_id;
        }
        if patch.metadata_path.is_some() {
            entry.metadata_path = patch.metadata_path;
        }
        if patch.cover_path.is_some() {
            entry.cover_path = patch.cover_path;
        }
        for (quality, incoming) in patch.qualities {
            match entry.qualities.get_mut(&quality) {
                Some(existing) => {
                    existing.path = incoming.path;
                    existing.size = incoming.size;
                    existing.modified_ms = incoming.modified_ms;
                    for tag in incoming.owners {
                        add_owner(&mut existing.owners, tag);
                    }
                }
                None => {
                    entry.qualities.insert(quality, incoming);
                }
            }
        }
        Ok(())
    }

    /// Merge `patch` into the album record. Track ids are unioned.
    pub fn upsert_album(&mut self, patch: AlbumEntry) -> Result<()> {
        let doc = self.document_mut()?;
        let entry = doc
            .albums
            .entry(patch.album_id)
            .or_insert_with(|| AlbumEntry::new(patch.album_id));
        if patch.title.is_some() {
            entry.title = patch.title;
        }
        if patch.artist.is_some() {
            entry.artist = patch.artist;
        }
        if patch.artist_id.is_some() {
            entry.artist_id = patch.artist_id;
        }
        if patch.metadata_path.is_some() {
            entry.metadata_path = patch.metadata_path;
        }
        if patch.cover_path.is_some() {
            entry.cover_path = patch.cover_path;
        }
        if patch.all_track_ids.is_some() {
            entry.all_track_ids = patch.all_track_ids;
        }
        union_ids(&mut entry.track_ids, patch.track_ids);
        Ok(())
    }

    /// Merge `patch` into the playlist record. Track ids are unioned.
    pub fn upsert_playlist(&mut self, patch: PlaylistEntry) -> Result<()> {
        let doc = self.document_mut()?;
        let entry = doc
            .playlists
            .entry(patch.playlist_id)
            .or_insert_with(|| PlaylistEntry::new(patch.playlist_id));
        if patch.title.is_some() {
            entry.title = patch.title;
        }
        if patch.metadata_path.is_some() {
            entry.metadata_path = patch.metadata_path;
        }
        if patch.items_path.is_some() {
            entry.items_path = patch.items_path;
        }
        union_ids(&mut entry.track_ids, patch.track_ids);
        Ok(())
    }

    /// Attach `tag` to a stored tier unless its owner is already recorded.
    ///
    /// The tier's `track.json` is updated too, so a rescan sees the same
    /// owners. Returns whether anything changed.
    pub fn stamp_owner(
        &mut self,
        track_id: u64,
        quality: &Quality,
        tag: OwnershipTag,
    ) -> Result<bool> {
        let doc = self.document_mut()?;
        let Some(entry) = doc
            .tracks
            .get_mut(&track_id)
            .and_then(|t| t.qualities.get_mut(quality))
        else {
            return Err(Error::not_found(format!("track {track_id} at {quality}")));
        };
        if !add_owner(&mut entry.owners, tag.clone()) {
            return Ok(false);
        }
        debug!("Stamped {} onto track {} at {}", tag.owner, track_id, quality);

        if let Some(dir) = entry.path.parent() {
            let sidecar = dir.join(TRACK_FILE);
            if let Some(mut document) = read_json::<TrackDocument>(&sidecar)
                && add_owner(&mut document.owners, tag)
            {
                write_json_atomic(&sidecar, &document)?;
            }
        }
        Ok(true)
    }

    /// Drop one tier. Removes the track (and its album link) if it was the last.
    ///
    /// Returns whether the whole track was removed.
    pub fn remove_quality(&mut self, track_id: u64, quality: &Quality) -> Result<bool> {
        let doc = self.document_mut()?;
        let Some(entry) = doc.tracks.get_mut(&track_id) else {
            return Ok(false);
        };
        entry.qualities.remove(quality);
        if entry.qualities.is_empty() {
            self.remove_track(track_id)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop a track and unlink it from its album.
    pub fn remove_track(&mut self, track_id: u64) -> Result<Option<TrackEntry>> {
        let doc = self.document_mut()?;
        let removed = doc.tracks.remove(&track_id);
        if let Some(album_id) = removed.as_ref().and_then(|t| t.album_id)
            && let Some(album) = doc.albums.get_mut(&album_id)
        {
            album.track_ids.retain(|id| *id != track_id);
            if album.track_ids.is_empty() {
                debug!("Album {} has no downloaded tracks left", album_id);
                doc.albums.remove(&album_id);
            }
        }
        Ok(removed)
    }

    /// Drop an album record (tracks are left alone).
    pub fn remove_album(&mut self, album_id: u64) -> Result<Option<AlbumEntry>> {
        Ok(self.document_mut()?.albums.remove(&album_id))
    }

    /// Drop a playlist record.
    pub fn remove_playlist(&mut self, playlist_id: u64) -> Result<Option<PlaylistEntry>> {
        Ok(self.document_mut()?.playlists.remove(&playlist_id))
    }

    /// Every track with at least one valid tier. Stale tiers are pruned.
    pub fn list_downloaded_tracks(&mut self) -> Result<Vec<DownloadedTrack>> {
        let report = self.prune_qualities()?;
        if report.qualities_removed > 0 {
            self.save()?;
        }

        let doc = self.document()?;
        let tracks = doc
            .tracks
            .values()
            .filter_map(|entry| {
                let qualities: Vec<Quality> = fallback_order(None, entry.qualities.keys())
                    .into_iter()
                    .filter(|q| entry.qualities.contains_key(q))
                    .collect();
                let best = qualities.first()?;
                Some(DownloadedTrack {
                    track_id: entry.track_id,
                    album_id: entry.album_id,
                    path: entry.qualities[best].path.clone(),
                    qualities,
                    cover_path: entry.cover_path.clone(),
                })
            })
            .collect();
        Ok(tracks)
    }

    /// Every playlist with its offline availability.
    ///
    /// The downloaded count is the larger of the validated `items.json`
    /// downloads map and the number of indexed tracks owned by the playlist.
    pub fn list_downloaded_playlists(&mut self) -> Result<Vec<DownloadedPlaylist>> {
        let report = self.prune_qualities()?;
        if report.qualities_removed > 0 {
            self.save()?;
        }

        let doc = self.document()?;
        let playlists = doc
            .playlists
            .values()
            .map(|entry| {
                let playlist_id = entry.playlist_id;
                let explicit = read_json::<PlaylistItems>(&self.layout.playlist_items(playlist_id))
                    .map_or(0, |items| {
                        items
                            .downloads
                            .values()
                            .filter(|d| is_non_empty_file(&d.path))
                            .count()
                    });
                let owner = Owner::Playlist { playlist_id };
                let owned = doc.tracks.values().filter(|t| t.has_owner(&owner)).count();
                let downloaded_count = explicit.max(owned);
                DownloadedPlaylist {
                    playlist_id,
                    title: entry.title.clone(),
                    track_count: entry.track_ids.len().max(downloaded_count),
                    downloaded_count,
                }
            })
            .collect();
        Ok(playlists)
    }

    /// The validated mirror of `track_id` inside `playlist_id`, if any.
    pub fn playlist_download(
        &self,
        playlist_id: u64,
        track_id: u64,
    ) -> Result<Option<PlaylistDownload>> {
        self.document()?;
        let download = read_json::<PlaylistItems>(&self.layout.playlist_items(playlist_id))
            .and_then(|mut items| items.downloads.remove(&track_id))
            .filter(|d| is_non_empty_file(&d.path));
        Ok(download)
    }

    /// Validate every entry against disk and drop what no longer holds.
    pub fn prune(&mut self) -> Result<PruneReport> {
        let mut report = self.prune_qualities()?;
        let layout = self.layout.clone();
        let doc = self.document_mut()?;

        let track_ids: BTreeSet<u64> = doc.tracks.keys().copied().collect();
        let before = doc.albums.len();
        doc.albums.retain(|_, album| {
            album.track_ids.retain(|id| track_ids.contains(id));
            !album.track_ids.is_empty()
        });
        report.albums_removed = before - doc.albums.len();

        let before = doc.playlists.len();
        doc.playlists.retain(|id, _| layout.playlist_dir(*id).is_dir());
        report.playlists_removed = before - doc.playlists.len();

        self.save()?;
        info!(
            "Pruned index: {} qualities, {} tracks, {} albums, {} playlists",
            report.qualities_removed,
            report.tracks_removed,
            report.albums_removed,
            report.playlists_removed
        );
        Ok(report)
    }

    /// Drop every tier whose file is gone or empty, cascading to tracks.
    fn prune_qualities(&mut self) -> Result<PruneReport> {
        let stale: Vec<(u64, Quality)> = self
            .document()?
            .tracks
            .values()
            .flat_map(|t| {
                t.qualities
                    .iter()
                    .filter(|(_, q)| !is_non_empty_file(&q.path))
                    .map(|(quality, _)| (t.track_id, quality.clone()))
            })
            .collect();

        let mut report = PruneReport::default();
        for (track_id, quality) in stale {
            warn!(
                "Pruning stale {} entry of track {}: file missing or empty",
                quality, track_id
            );
            report.qualities_removed += 1;
            if self.remove_quality(track_id, &quality)? {
                report.tracks_removed += 1;
            }
        }
        Ok(report)
    }
}

fn union_ids(target: &mut Vec<u64>, incoming: Vec<u64>) {
    for id in incoming {
        if !target.contains(&id) {
            target.push(id);
        }
    }
}
